use envconfig::Envconfig;
use tracing_subscriber::{
    EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Log output settings, read from the environment next to
/// [`crate::ShardConfig`].
#[derive(Envconfig, Clone, Debug)]
pub struct LogConfig {
    #[envconfig(from = "RUST_LOG", default = "info")]
    pub filter: String,
    /// `text` or `json`.
    #[envconfig(from = "LOG_FORMAT", default = "text")]
    pub format: String,
}

impl LogConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Installs the process-wide subscriber. Shard lifecycle events carry the
/// shard ID in their message, so JSON lines are flattened for log search.
pub fn init_tracing(
    conf: &LogConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_new(&conf.filter)?;
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    let layer = if conf.is_json() {
        layer.json().flatten_event(true).boxed()
    } else {
        layer.compact().boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;
    Ok(())
}
