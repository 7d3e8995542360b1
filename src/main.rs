// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use cli::Commands;
use relay_gateway::{security::FailureLimiter, GatewayState};
use relay_providers::{
    list_drivers, DeepSeekConfig, DeepSeekProvider, GrokProvider, MediaCache, ModelProvider,
    ModelRegistry,
};
use relay_store::{CredentialPoolSelector, ProxyConfig, ProxyPool, TokenFileCache};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(*shell);
            return Ok(());
        }
        Some(Commands::ShowConfig) => {
            let config = relay_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            return Ok(());
        }
        Some(Commands::RegenerateAdminPassword { password }) => {
            relay_config::regenerate_admin_password(cli.config.as_deref(), password)?;
            println!("admin password updated");
            return Ok(());
        }
        Some(Commands::Serve) | None => {}
    }

    // A failure to load or parse config.yaml terminates the process;
    // anyhow's Display on the returned error drives the nonzero exit.
    let config = relay_config::load(cli.config.as_deref())?;

    let secure_cookies = std::env::var("NODE_ENV").map(|v| v == "production").unwrap_or(false);

    let cache = TokenFileCache::new(cli.accounts_dir.clone());
    let selector = Arc::new(CredentialPoolSelector::new());
    let registry = Arc::new(ModelRegistry::new());
    let proxy = Arc::new(ProxyPool::new(ProxyConfig {
        static_proxy: config.grok.proxy_url.clone(),
        pool_url: config.grok.proxy_pool_url.clone(),
        interval: std::time::Duration::from_secs(config.grok.proxy_pool_interval),
    }));
    let media_images = Arc::new(MediaCache::new(cli.media_dir.join("image"), config.grok.image_cache_max_size_mb));
    let media_videos = Arc::new(MediaCache::new(cli.media_dir.join("video"), config.grok.video_cache_max_size_mb));

    let mut providers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
    let enabled: Vec<String> = config.enabled_projects().into_iter().map(str::to_string).collect();

    for project in &enabled {
        cache.preload_project(project).await;
        info!(%project, "preloaded credential cache");
    }

    if enabled.iter().any(|p| p == "deepseek") {
        let credential_ids = cache.get_token_list("deepseek").await;
        selector.register(&["deepseek".to_string()], &credential_ids, "deepseek");

        let deepseek = DeepSeekProvider::new(
            DeepSeekConfig {
                accounts_root: cli.accounts_dir.clone(),
                ..Default::default()
            },
            cache.clone(),
            selector.clone(),
            config.keys.clone(),
        );
        providers.insert("deepseek".to_string(), Arc::new(deepseek));
    }

    if enabled.iter().any(|p| p == "grok") {
        let grok = Arc::new(GrokProvider::new(
            config.grok.clone(),
            cli.accounts_dir.clone(),
            selector.clone(),
            proxy.clone(),
            media_images.clone(),
            media_videos.clone(),
        )?);
        if config.grok.auto_refresh_tokens {
            grok.clone().spawn_background_refresher();
        }
        providers.insert("grok".to_string(), grok);
    }

    for driver in list_drivers().iter().filter(|d| providers.contains_key(d.owner_tag)) {
        for model_id in driver.model_ids {
            registry.register(model_id, driver.owner_tag);
        }
    }

    let state = GatewayState {
        config: Arc::new(config),
        cache,
        selector,
        registry,
        providers: Arc::new(providers),
        accounts_root: cli.accounts_dir,
        media_images,
        media_videos,
        admin_sessions: Arc::new(relay_gateway::admin::AdminSessions::new()),
        secure_cookies,
        failure_limiter: Arc::new(FailureLimiter::new(120, 10)),
    };

    relay_gateway::serve(state, cli.listen).await
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
