//! Job server command: `devjobs serve`.

use anyhow::Result;
use devjobs::config::DevJobsToml;
use std::path::PathBuf;

pub async fn cmd_serve(config: DevJobsToml, project_dir: PathBuf) -> Result<()> {
    if config.dev_mode() {
        println!(
            "Dev mode: permissive CORS, listening on 0.0.0.0:{}",
            config.port()
        );
    }
    devjobs::server::start_server(config, project_dir).await
}
