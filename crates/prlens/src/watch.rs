//! `prlens watch`: follow a session from the terminal.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use prlens_client::{ClientOptions, ConnectionState, HttpFeed, SessionClient};
use prlens_core::Event;
use prlens_settings::PrlensSettings;
use prlens_tokens::ParsedMessage;
use prlens_upstream::{OpencodeControl, SendOutcome, UpstreamConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::WatchArgs;

pub(crate) async fn run(settings: &PrlensSettings, args: WatchArgs) -> Result<()> {
    let server = args
        .server
        .unwrap_or_else(|| format!("http://{}", settings.server.bind_addr()));
    let feed = HttpFeed::new(&server, settings.upstream.connect_timeout())
        .context("failed to create event feed")?;
    let control = OpencodeControl::new(&UpstreamConfig::from_settings(&settings.upstream))
        .context("failed to create control client")?;
    let client = SessionClient::new(
        Arc::new(feed),
        Arc::new(control),
        ClientOptions::from_settings(&settings.client),
    );

    let mut updates = client.updates();
    let mut states = client.watch_state();
    client.connect(&args.session)?;

    if let Some(text) = &args.message {
        match client.send_message(text, args.agent.as_deref()).await? {
            SendOutcome::Accepted => eprintln!("[message sent]"),
            SendOutcome::Rejected { reason } => bail!("message rejected: {reason}"),
        }
    }

    let result = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *states.borrow_and_update();
                eprintln!("[{state}]");
                if state == ConnectionState::Disconnected {
                    break Err(anyhow::anyhow!("gave up reconnecting to {server}"));
                }
            }
            update = updates.recv() => match update {
                Ok(event) => {
                    print_event(&event);
                    if matches!(event, Event::Done { .. }) {
                        if let Some(streaming) = client.parsed() {
                            print_directives(&streaming.parsed);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "watch output lagging"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    client.disconnect().await;
    result
}

fn print_event(event: &Event) {
    match event {
        Event::TextDelta { delta, .. } => {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(delta.as_bytes());
            let _ = out.flush();
        }
        Event::ToolStart { tool, .. } => eprintln!("\n[tool {tool}]"),
        Event::ToolDone { tool, title, .. } => eprintln!("[tool {tool} done: {title}]"),
        Event::ToolError { tool, error, .. } => eprintln!("[tool {tool} failed: {error}]"),
        Event::StatusChanged {
            status, message, ..
        } => match message {
            Some(message) => eprintln!("[{status}: {message}]"),
            None => eprintln!("[{status}]"),
        },
        Event::StreamError { code, message, .. } => eprintln!("[error {code}: {message}]"),
        Event::Done { .. } => println!(),
        Event::Connected | Event::ReasoningDelta { .. } | Event::ToolRunning { .. } => {}
    }
}

fn print_directives(parsed: &ParsedMessage) {
    if let Some(order) = &parsed.review_order {
        eprintln!("review order:");
        for (i, file) in order.iter().enumerate() {
            eprintln!("  {}. {file}", i + 1);
        }
    }
    for annotation in &parsed.annotations {
        eprintln!(
            "  {} {}:{} {}",
            annotation.severity, annotation.file, annotation.line, annotation.message
        );
    }
}
