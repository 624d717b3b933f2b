fn main() {
    if let Err(e) = voidchat_lib::run() {
        eprintln!("voidchat: {:#}", e);
        std::process::exit(1);
    }
}
