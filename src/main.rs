fn main() {
    match intentguard::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("intentguard: {}", err);
            std::process::exit(err.abort_category().exit_code());
        }
    }
}
