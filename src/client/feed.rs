use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::api::ApiClient;

/// Print every event feed message, one JSON document per line, until the
/// server closes the feed or ctrl-c.
pub async fn follow(api: &ApiClient, subject: Option<&str>) -> Result<()> {
    let mut url = api.ws_url("/ws/events")?;
    if let Some(subject) = subject {
        url.query_pairs_mut().append_pair("subject", subject);
    }

    let (ws, _) = connect_async(url.as_str())
        .await
        .context("Failed to connect to event feed")?;
    let (_sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => println!("{}", text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Event feed error"),
                }
            }
        }
    }
    Ok(())
}
