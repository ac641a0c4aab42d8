mod transport;

use feed_client::{
    ActivitySignal, NotificationClient, RequestDeduplicator, Settings, SmartNotificationPoller,
};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use transport::SurfTransport;

const HELP: &str = "commands: poll | hide | show | stats | cancel | quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;

    TermLogger::init(
        settings.log_level(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let subject = settings
        .subject
        .clone()
        .ok_or("no subject configured, set `subject` or FEED_SUBJECT")?;

    let deduplicator = Arc::new(RequestDeduplicator::new(settings.deduplication_config()));
    let mut client = NotificationClient::new(
        settings.api_base_url.clone(),
        Arc::new(SurfTransport::new()),
        deduplicator.clone(),
    );
    if let Some(token) = &settings.auth_token {
        client = client.with_auth_token(token.clone());
    }

    let poller = SmartNotificationPoller::new(settings.polling_config(), Arc::new(client));
    let _updates = poller.on_update(|update| {
        log::info!(
            "{} notifications, {} unread ({})",
            update.notifications().len(),
            update.unread_count(),
            update.timestamp().format("%H:%M:%S")
        );
    });
    let _errors = poller.on_error(|error| log::error!("Notification fetch failed: {}", error));

    log::info!("Watching notifications for {} at {}", subject, settings.api_base_url);
    println!("{}", HELP);
    poller.start(subject);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                poller.record_activity(ActivitySignal::KeyDown);
                match line.trim() {
                    "" => {}
                    "poll" => poller.poll().await,
                    "hide" => poller.set_hidden(true),
                    "show" => poller.set_hidden(false),
                    "stats" => {
                        println!("{}", serde_json::to_string_pretty(&poller.stats())?);
                        println!("{}", serde_json::to_string_pretty(&deduplicator.stats())?);
                    }
                    "cancel" => {
                        log::info!("Cancelled {} pending requests", deduplicator.cancel_all())
                    }
                    "quit" | "exit" => break,
                    other => println!("unknown command `{}`, {}", other, HELP),
                }
            }
        }
    }

    poller.stop();
    deduplicator.cancel_all();
    log::info!("Stopped");
    Ok(())
}
