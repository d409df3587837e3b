// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thin process entry point: load settings, wire the proxy core, run the
//! keep-alive worker until interrupted. API surfaces (REST, SDK shims) are
//! separate adapters over [`mailbridge::proxy::MailProxy`].

use std::sync::Arc;

use dotenvy::dotenv;
use log::{error, info};

use mailbridge::config::Settings;
use mailbridge::proxy::MailProxy;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenv().ok();

    let config_path = std::env::args().nth(1);
    let settings = match Settings::new(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load application settings: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e));
        }
    };

    env_logger::init_from_env(env_logger::Env::new().default_filter_or(settings.log.level.clone()));
    info!(
        "mailbridge_starting inboxes={} store={}",
        settings.inboxes.len(),
        settings.store_url.is_some()
    );

    let proxy = match MailProxy::from_settings(&settings).await {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!("startup_failed err={}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    let worker = Arc::new(proxy.keepalive_worker());
    let worker_task = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            worker.run().await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown_requested");
    worker.stop();
    let _ = worker_task.await;
    proxy.shutdown().await;
    info!("mailbridge_stopped");
    Ok(())
}
