use std::time::Duration;

use relink::{socketio::Client, ReconnectPolicy};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let url = std::env::var("CHAT_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let client = Client::builder(&url)
        .reconnect(
            ReconnectPolicy::exponential(Duration::from_millis(500), 2.0, Duration::from_secs(30))
                .jitter(0.2),
        )
        .build()
        .map_err(|err| {
            println!("Invalid CHAT_URL: {}", err);
            std::process::exit(1);
        })
        .unwrap();

    let room = client.namespace("/chat");
    room.on("connect", |_, _| println!("* joined /chat"));
    room.on("disconnect", |args, _| println!("* left /chat: {:?}", args));
    room.on("message", |args, _| println!("{:?}", args));

    client.connect().await.unwrap();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let result = room
            .emit_with_ack("message", vec![line.into()], |answer| match answer {
                Ok(args) => log::debug!("Server stored message: {:?}", args),
                Err(err) => println!("* {}", err),
            })
            .await;

        if let Err(err) = result {
            println!("* send failed: {}", err);
        }
    }

    client.disconnect().await;
}
