use cadence::Application;
use std::sync::Arc;

mod controllers;
mod requests;
mod routes;
mod senders;
mod state;

#[tokio::main]
async fn main() {
    let result = Application::new()
        .sender(Arc::new(senders::LogSender))
        .routes(routes::register)
        .run()
        .await;

    if let Err(err) = result {
        tracing::error!(error = %err, "exiting");
        std::process::exit(1);
    }
}
