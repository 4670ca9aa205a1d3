use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static TRACING: OnceCell<()> = OnceCell::new();

const DEFAULT_DIRECTIVES: &str = "querier=info,tower_http=info";

/// Installs the global subscriber once; `RUST_LOG` overrides the default directives.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .init();
    });
}
