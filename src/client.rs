//! Minimal WebSocket client for publishing a note to a relay by hand.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use secp256k1::{Keypair, Secp256k1};
use serde_json::{json, Value};
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::event::Event;

/// Subscription opened before publishing so the relay echoes the event back.
const SUB_ID: &str = "sub1";

/// What the relay said about a published event.
#[derive(Debug)]
pub struct Publication {
    pub event: Event,
    /// Every relay frame received, in order, as raw JSON text.
    pub responses: Vec<String>,
    /// `OK` verdict and message for the event, if one arrived in time.
    pub verdict: Option<(bool, String)>,
}

/// Load a secret key from hex, or generate a fresh one.
pub fn keypair(secret: Option<&str>) -> Result<Keypair> {
    let secp = Secp256k1::new();
    if let Some(hex_key) = secret {
        let bytes = hex::decode(hex_key.trim()).context("secret key is not hex")?;
        return Keypair::from_seckey_slice(&secp, &bytes).context("invalid secret key");
    }
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 32];
    // out-of-range scalars are astronomically rare; draw again if one appears
    loop {
        rng.fill_bytes(&mut bytes);
        if let Ok(keys) = Keypair::from_seckey_slice(&secp, &bytes) {
            return Ok(keys);
        }
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Connect to `relay`, subscribe to everything, publish one signed event and
/// collect responses until the relay answers with `OK` for it or `wait`
/// elapses.
pub async fn publish(
    relay: &str,
    keys: &Keypair,
    kind: u32,
    content: &str,
    wait: Duration,
) -> Result<Publication> {
    let event = Event::signed(keys, kind, now(), vec![], content)?;
    let (mut ws, _) = connect_async(relay)
        .await
        .with_context(|| format!("connecting to {relay}"))?;
    ws.send(Message::Text(json!(["REQ", SUB_ID, {}]).to_string()))
        .await?;
    ws.send(Message::Text(json!(["EVENT", &event]).to_string()))
        .await?;
    debug!(id = %event.id, relay, "event sent");

    let deadline = Instant::now() + wait;
    let mut responses = Vec::new();
    let mut verdict = None;
    while verdict.is_none() {
        let frame = match timeout_at(deadline, ws.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => break,
            Err(_) => break,
        };
        match frame {
            Message::Text(txt) => {
                verdict = ok_for(&txt, &event.id);
                responses.push(txt);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = ws.close(None).await;
    Ok(Publication {
        event,
        responses,
        verdict,
    })
}

/// Extract `(accepted, message)` from an `["OK", id, bool, msg]` frame for `id`.
fn ok_for(txt: &str, id: &str) -> Option<(bool, String)> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    if arr.first()?.as_str()? != "OK" || arr.get(1)?.as_str()? != id {
        return None;
    }
    let accepted = arr.get(2)?.as_bool()?;
    let message = arr.get(3).and_then(Value::as_str).unwrap_or_default();
    Some((accepted, message.to_string()))
}

impl Publication {
    /// Fail unless the relay accepted the event.
    pub fn into_result(self) -> Result<Self> {
        match &self.verdict {
            Some((true, _)) => Ok(self),
            Some((false, msg)) => bail!("relay rejected {}: {msg}", self.event.id),
            None => Err(anyhow!("no OK received for {}", self.event.id)),
        }
    }
}
