//! Two scripts meeting in an in-process space.
//!
//! Run with: cargo run -p loopback-demo
//!
//! Set `RUST_LOG=debug` to see the routing inside the session manager.

use std::time::Duration;

use anyhow::{Context, bail};
use kata_core::{DVec3, LocationUpdate, SolidAngle, SpaceId};
use kata_protocol::{FromScript, channel, encode_envelope};
use kata_script::{ConnectOptions, PresenceView, Script};
use kata_session::{HostEvent, SessionConfig, SessionManager};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SPACE: &str = "loop://demo/";
const GREETING_PORT: u32 = 14;

/// Handle one message for `script`, failing if none arrives in time.
async fn pump(name: &str, script: &mut Script) -> anyhow::Result<()> {
    let alive = tokio::time::timeout(Duration::from_secs(1), script.step())
        .await
        .with_context(|| format!("{name} waited too long for the host"))?;
    if !alive {
        bail!("{name}: host hung up");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let space = SpaceId::parse(SPACE)?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let config = SessionConfig::with_loopback().with_host_events(events_tx);
    let mut manager = SessionManager::new(config);
    let (watcher_end, watcher_host) = channel::pair();
    let (visitor_end, visitor_host) = channel::pair();
    manager.attach(watcher_host);
    manager.attach(visitor_host);
    let session = tokio::spawn(manager.run());

    let host_events = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                HostEvent::CreateObject {
                    from,
                    script,
                    constructor,
                    ..
                } => tracing::info!(%from, "Create object requested: {constructor} from {script}"),
                HostEvent::Graphics { from, message } => {
                    tracing::info!(%from, "Graphics: {message:?}");
                }
            }
        }
    });

    let mut watcher = Script::new(watcher_end);
    let mut visitor = Script::new(visitor_end);

    watcher.connect_with(
        space.clone(),
        ConnectOptions {
            query: Some(SolidAngle(0.01)),
            ..ConnectOptions::default()
        },
        |result| match result {
            Ok(presence) => {
                tracing::info!(id = %presence.id(), "Watcher connected");
                let watching = presence.set_query_handler(|remote, entered| {
                    let verb = if entered { "arrived" } else { "left" };
                    tracing::info!(id = %remote.id(), "Visitor {verb}");
                });
                if let Err(e) = watching {
                    tracing::warn!("Watcher cannot track visitors: {e}");
                }
            }
            Err(failure) => tracing::error!("Watcher could not connect: {}", failure.reason),
        },
    )?;
    pump("watcher", &mut watcher).await?;

    visitor.connect(space.clone(), None, |result| {
        if let Ok(presence) = result {
            tracing::info!(id = %presence.id(), "Visitor connected");
        }
    })?;
    pump("visitor", &mut visitor).await?;
    pump("watcher", &mut watcher).await?;

    let visitor_id = visitor
        .presence(&space)
        .map(PresenceView::id)
        .context("visitor has no presence")?;

    visitor.bind_odp_port(&space, GREETING_PORT, |msg| {
        tracing::info!(
            from = %msg.source_object,
            "Visitor got: {}",
            String::from_utf8_lossy(&msg.payload)
        );
    })?;
    watcher
        .presence_mut(&space)
        .context("watcher has no presence")?
        .send_odp_message(visitor_id, GREETING_PORT, GREETING_PORT, b"welcome".to_vec())?;
    pump("visitor", &mut visitor).await?;

    let presence = visitor.presence_mut(&space).context("visitor has no presence")?;
    presence.set_velocity(DVec3::new(1.0, 0.0, 0.0))?;
    // Already moving at this velocity; nothing is sent.
    presence.set_velocity(DVec3::new(1.0, 0.0, 0.0))?;
    pump("visitor", &mut visitor).await?;
    pump("watcher", &mut watcher).await?;

    if let Some(presence) = watcher.presence(&space) {
        for remote in watcher.remote_presences() {
            let now = presence.now();
            tracing::info!(
                id = %remote.id(),
                "Watcher sees visitor at {} moving {}",
                remote.position(now),
                remote.velocity()
            );
        }
    }

    visitor.create_object(
        "scripts/echo.js",
        "Echo",
        serde_json::json!({ "port": GREETING_PORT }),
    )?;

    let presence = visitor.presence_mut(&space).context("visitor has no presence")?;
    tracing::info!(
        "Wire form of a location request: {}",
        encode_envelope(&FromScript::Location {
            space: space.clone(),
            id: presence.id(),
            loc: LocationUpdate::from(*presence.requested_location()),
            vis: None,
        })?
    );
    presence.disconnect()?;
    pump("visitor", &mut visitor).await?;
    pump("watcher", &mut watcher).await?;

    if let Some(presence) = visitor.presence(&space) {
        tracing::info!(status = ?presence.status(), "Visitor session closed");
    }

    drop(watcher);
    drop(visitor);
    session.await?;
    host_events.await?;
    Ok(())
}
