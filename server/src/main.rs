//! SoundTag server binary.

use soundtag::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    soundtag::init_logging();

    let config = ServerConfig::from_env()?;
    soundtag::serve(config).await
}
