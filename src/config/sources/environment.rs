//! Environment source: SETTLE_RUNNER__MAX_BATCH_SIZE=8 sets runner.max_batch_size

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::Environment;

pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix("SETTLE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    )
}
