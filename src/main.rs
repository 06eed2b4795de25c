mod app;
mod dispatcher;
mod gateway;
mod handover;
mod media;
mod menu;
mod orders;
mod store;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
