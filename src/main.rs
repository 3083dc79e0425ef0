use ffmpeg_next::{self as ffmpeg};
use tracing_subscriber::EnvFilter;
use video_thumbnailer::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    ffmpeg::init()?;

    let config = Config::load()?;
    video_thumbnailer::run(config).await
}
