use log::error;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    if let Err(e) = mailhook::run().await {
        error!("Application error: {e:#}");
        std::process::exit(1);
    }
}
