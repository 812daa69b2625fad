pub mod error;
pub mod host;
pub mod ids;
pub mod messages;
pub mod page;
pub mod protocol;

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    fn default_language() -> String {
        "en".to_string()
    }

    fn default_ollama_base_url() -> String {
        "http://127.0.0.1:11434".to_string()
    }

    fn default_model() -> String {
        "llama3.2-vision:11b".to_string()
    }

    fn default_context_window() -> u64 {
        8192
    }

    fn default_context_budget_bytes() -> usize {
        10 * 1024
    }

    fn default_quota_check_interval() -> usize {
        10
    }

    /// How verbose the description should be
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DetailLevel {
        Brief,
        #[default]
        Standard,
        Detailed,
    }

    impl DetailLevel {
        /// Word target handed to prompt construction
        pub fn max_words(self) -> usize {
            match self {
                DetailLevel::Brief => 60,
                DetailLevel::Standard => 150,
                DetailLevel::Detailed => 300,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserSettings {
        #[serde(default = "default_language")]
        pub language: String, // BCP-47 tag, e.g. "en", "es", "ja"
        #[serde(default)]
        pub detail_level: DetailLevel,
    }

    impl Default for UserSettings {
        fn default() -> Self {
            Self {
                language: default_language(),
                detail_level: DetailLevel::default(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelSettings {
        #[serde(default = "default_ollama_base_url")]
        pub ollama_base_url: String,
        #[serde(default = "default_model")]
        pub model: String, // must accept image input
        /// Token window of the model, used as the session quota
        #[serde(default = "default_context_window")]
        pub context_window: u64,
    }

    impl Default for ModelSettings {
        fn default() -> Self {
            Self {
                ollama_base_url: default_ollama_base_url(),
                model: default_model(),
                context_window: default_context_window(),
            }
        }
    }

    /// Deadlines and pacing for talking to the worker context.
    ///
    /// Stored as milliseconds so the settings file stays hand-editable.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct DeliveryTimings {
        pub probe_timeout_ms: u64,
        pub ack_timeout_ms: u64,
        pub stream_grace_ms: u64,
        pub rpc_timeout_ms: u64,
        pub settle_delay_ms: u64,
        pub probe_retry_delay_ms: u64,
        pub probe_attempts: u32,
    }

    impl Default for DeliveryTimings {
        fn default() -> Self {
            Self {
                probe_timeout_ms: 2_000,
                ack_timeout_ms: 5_000,
                stream_grace_ms: 10_000,
                rpc_timeout_ms: 30_000,
                settle_delay_ms: 300,
                probe_retry_delay_ms: 200,
                probe_attempts: 5,
            }
        }
    }

    impl DeliveryTimings {
        pub fn probe_timeout(&self) -> Duration {
            Duration::from_millis(self.probe_timeout_ms)
        }

        pub fn ack_timeout(&self) -> Duration {
            Duration::from_millis(self.ack_timeout_ms)
        }

        pub fn stream_grace(&self) -> Duration {
            Duration::from_millis(self.stream_grace_ms)
        }

        pub fn rpc_timeout(&self) -> Duration {
            Duration::from_millis(self.rpc_timeout_ms)
        }

        pub fn settle_delay(&self) -> Duration {
            Duration::from_millis(self.settle_delay_ms)
        }

        pub fn probe_retry_delay(&self) -> Duration {
            Duration::from_millis(self.probe_retry_delay_ms)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AppSettings {
        #[serde(default)]
        pub user: UserSettings,
        #[serde(default)]
        pub model: ModelSettings,
        #[serde(default)]
        pub timings: DeliveryTimings,
        /// Ceiling for serialized page context bundled with an image prompt
        #[serde(default = "default_context_budget_bytes")]
        pub context_budget_bytes: usize,
        /// Re-check quota every N streamed chunks
        #[serde(default = "default_quota_check_interval")]
        pub quota_check_interval: usize,
    }

    impl Default for AppSettings {
        fn default() -> Self {
            Self {
                user: UserSettings::default(),
                model: ModelSettings::default(),
                timings: DeliveryTimings::default(),
                context_budget_bytes: default_context_budget_bytes(),
                quota_check_interval: default_quota_check_interval(),
            }
        }
    }
}
