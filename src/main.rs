fn main() {
    sage_chat::run()
}
