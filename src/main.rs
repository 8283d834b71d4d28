use anyhow::Result;
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use tokio::signal;

use chatpipe::prelude::*;

/// Echo `!say <text>` lines back through the pipeline so the whole
/// send path can be exercised from a terminal
async fn run_say_command(bot: Arc<ChatBot>, connection: Arc<ConsoleConnection>) {
    let Some(mut receiver) = connection.get_message_receiver() else {
        return;
    };

    while let Ok(message) = receiver.recv().await {
        let Some(text) = message.content.strip_prefix("!say ") else {
            continue;
        };
        let Some(platform) = bot.directory().platform_by_name(&message.platform).await else {
            continue;
        };
        let Some(channel) = bot.directory().find(platform.id, &message.channel).await else {
            warn!("Unknown channel #{}", message.channel);
            continue;
        };

        let options = SendOptions {
            command_used: true,
            invoker: Some(message.username.clone()),
            ..Default::default()
        };
        match bot.send(channel.id, text, &options).await {
            Ok(outcome) => info!("!say in #{}: {:?}", channel.name, outcome),
            Err(e) => error!("!say in #{} failed: {:#}", channel.name, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config_dir = env::var("CHATPIPE_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let log_level = ConfigurationManager::peek_log_level(&config_dir).unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Starting chatpipe v{}", chatpipe::VERSION);

    let config_manager = ConfigurationManager::new(&config_dir);
    if let Err(e) = config_manager.initialize().await {
        error!("Failed to initialize configuration system: {}", e);
        return Err(e);
    }
    let bot_config = config_manager.get_bot_config().await;

    let bot = Arc::new(ChatBot::new(
        &bot_config,
        RuleFunctionTable::new(),
        Arc::new(YamlRuleSource::new(config_manager.rules_path())),
        Arc::new(JsonLinesDenialLog::new(&bot_config.core.denial_log_path)),
    )?);

    // Only the first console transport reads stdin
    let mut input_connection = None;
    for (index, platform) in bot_config.platforms.iter().enumerate() {
        let connection =
            Arc::new(ConsoleConnection::new(platform.name.clone(), platform.self_name.clone()).with_input(index == 0));
        if index == 0 {
            input_connection = Some(Arc::clone(&connection));
        }
        bot.add_connection(connection).await;
    }

    match bot.reload_rules().await {
        Ok(count) => info!("Loaded {} banphrase rules", count),
        Err(e) => warn!("Starting without banphrase rules: {:#}", e),
    }

    bot.start().await?;
    bot.watch_config(&config_manager).await;

    if let Some(connection) = input_connection {
        tokio::spawn(run_say_command(Arc::clone(&bot), connection));
    }

    if let Ok(port) = env::var("CHATPIPE_WEB_PORT") {
        match port.parse::<u16>() {
            Ok(port) => bot.start_web_dashboard(port).await?,
            Err(_) => warn!("Ignoring invalid CHATPIPE_WEB_PORT '{}'", port),
        }
    }

    info!("chatpipe is running. Type '#channel user: text' to chat, Ctrl+C to stop");
    signal::ctrl_c().await?;

    info!("Shutdown signal received");
    bot.shutdown().await?;
    Ok(())
}
