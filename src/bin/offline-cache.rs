use std::env;

#[tokio::main]
async fn main() -> offline_cache::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();

    #[cfg(feature = "cli")]
    {
        use offline_cache::cli;

        match cli::parse_args(&args) {
            Ok(parsed) => cli::run(parsed).await,
            Err(message) => {
                eprintln!("Error: {message}");
                eprintln!();
                cli::print_usage();
                std::process::exit(2);
            }
        }
    }
    #[cfg(not(feature = "cli"))]
    {
        let _ = args;
        eprintln!("CLI support not compiled in");
        std::process::exit(1);
    }
}
