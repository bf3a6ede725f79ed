fn main() {
    if handle_cli_flags() {
        return;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = redlurk::run(&args) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("redlurk {}", redlurk::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{}", redlurk::app::USAGE);
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
