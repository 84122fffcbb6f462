pub mod error;
pub mod memory;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::{KontextError, Result};
pub use models::conditioning::ConditioningInput;
pub use models::flux_model_trait::{FluxModel, GuidanceMode};
pub use trainers::{load_config, Config, GenerateImageConfig, ModelConfig, ProcessConfig};
pub use trainers::{FluxKontextModel, GuidanceScale, PromptEmbeds, TargetSize};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped logger at info level, `RUST_LOG` overrides
    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
