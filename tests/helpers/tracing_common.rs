use tracing::Level;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

/// Set up a global tracing subscriber.
///
/// Every test calls this; only the first call in a process installs it.
pub(crate) fn setup_tracing() {
    let filter_layer = Targets::new()
        .with_default(Level::INFO)
        .with_target("h2rpc", Level::DEBUG);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_test_writer();

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init();
}
