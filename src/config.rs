use serde::Deserialize;

use crate::rules::Rule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("rule {0} is missing when or emit")]
    InvalidRule(usize),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    /// Broker fan-out settings. The YAML key is `watermill` so deployment
    /// files written for the original gateway keep working.
    #[serde(rename = "watermill")]
    pub broker: BrokerConfig,
    pub rules: Vec<RuleConfig>,
    pub rules_strict: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub read_header_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub rate_limit_rps: u64,
    pub rate_limit_burst: u64,
    pub metrics_enabled: bool,
    pub metrics_path: String,
    pub public_base_url: Option<String>,
    pub debug_events: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout_ms: 5_000,
            write_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            read_header_timeout_ms: 5_000,
            max_body_bytes: 1 << 20,
            rate_limit_rps: 0,
            rate_limit_burst: 0,
            metrics_enabled: false,
            metrics_path: "/metrics".to_string(),
            public_base_url: None,
            debug_events: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub github: ProviderConfig,
    pub gitlab: ProviderConfig,
    pub bitbucket: ProviderConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Webhook mount path; defaults to `/webhooks/<provider>`.
    pub path: String,
    /// Shared secret (GitHub/GitLab) or hook UUID (Bitbucket). Empty means
    /// signature verification is skipped for this provider.
    pub secret: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Single-driver shorthand; `drivers` wins when both are set.
    pub driver: String,
    pub drivers: Vec<String>,
    #[serde(alias = "gochannel")]
    pub channel: ChannelConfig,
    pub nats: NatsConfig,
    pub http: HttpConfig,
    pub amqp: AmqpConfig,
    pub kafka: KafkaConfig,
    pub sql: SqlConfig,
    pub publish_retry: PublishRetryConfig,
    pub dlq_driver: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Fan-in / per-subscriber buffer capacity.
    pub output_buffer: usize,
    /// Retain published messages for topics with no subscriber yet.
    pub persistent: bool,
    /// Bus name; buses with the same name share topics within the process.
    pub bus: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            output_buffer: 64,
            persistent: false,
            bus: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub stream: String,
    pub durable: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream: "hookrelay".to_string(),
            durable: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    /// `topic_url` posts to the topic itself; `base_url` posts to
    /// `<base_url>/<topic>`.
    pub mode: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            mode: "topic_url".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub url: String,
    pub mode: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub consumer_group: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub driver: String,
    pub dsn: String,
    pub dialect: String,
    pub consumer_group: String,
    pub initialize_schema: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishRetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for PublishRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 500,
        }
    }
}

/// One rule as written in YAML; `emit` accepts a string or a list.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub when: String,
    #[serde(default)]
    pub emit: EmitList,
    #[serde(default)]
    pub drivers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EmitList {
    One(String),
    Many(Vec<String>),
}

impl Default for EmitList {
    fn default() -> Self {
        EmitList::Many(Vec::new())
    }
}

impl EmitList {
    /// Trimmed, non-empty topic names.
    pub fn values(&self) -> Vec<String> {
        let items: &[String] = match self {
            EmitList::One(s) => std::slice::from_ref(s),
            EmitList::Many(list) => list,
        };
        items
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}

impl Config {
    /// Load the config file: expand `$NAME` / `${NAME}` references against
    /// the environment, parse the YAML, apply defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(raw);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.providers.github.path.is_empty() {
            self.providers.github.path = "/webhooks/github".to_string();
        }
        if self.providers.gitlab.path.is_empty() {
            self.providers.gitlab.path = "/webhooks/gitlab".to_string();
        }
        if self.providers.bitbucket.path.is_empty() {
            self.providers.bitbucket.path = "/webhooks/bitbucket".to_string();
        }
        if self.broker.driver.is_empty() && self.broker.drivers.is_empty() {
            self.broker.driver = "channel".to_string();
        }
    }

    /// Normalize the configured rules: trimmed non-empty `when` and `emit`,
    /// trimmed driver names.
    pub fn normalized_rules(&self) -> Result<Vec<Rule>, ConfigError> {
        let mut out = Vec::with_capacity(self.rules.len());
        for (i, rule) in self.rules.iter().enumerate() {
            let when = rule.when.trim().to_string();
            let emit = rule.emit.values();
            if when.is_empty() || emit.is_empty() {
                return Err(ConfigError::InvalidRule(i));
            }
            let drivers = rule
                .drivers
                .iter()
                .map(|d| d.trim())
                .filter(|d| !d.is_empty())
                .map(|d| d.to_string())
                .collect();
            out.push(Rule { when, emit, drivers });
        }
        Ok(out)
    }
}

/// Expand `$NAME` and `${NAME}` environment references. Unset variables
/// expand to the empty string.
fn expand_env(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            // config files are expected to be UTF-8; copy byte-for-byte
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&input[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                i += 2 + end + 1;
                continue;
            }
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if end > start {
            out.push_str(&std::env::var(&input[start..end]).unwrap_or_default());
            i = end;
        } else {
            out.push('$');
            i += 1;
        }
    }
    out
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b < 0xE0 => 2,
        b if b < 0xF0 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let yaml = r#"
server:
  port: 9000
  max_body_bytes: 2048
  rate_limit_rps: 10
  metrics_enabled: true
providers:
  github:
    enabled: true
    secret: topsecret
  gitlab:
    enabled: true
    path: /hooks/gl
watermill:
  drivers: [channel, nats]
  nats:
    url: nats://localhost:4222
    durable: gateway
  publish_retry:
    attempts: 5
rules:
  - when: action == "opened"
    emit: pr.opened
  - when: contains(labels, "bug")
    emit: [label.bug, triage]
    drivers: [nats]
rules_strict: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_body_bytes, 2048);
        assert_eq!(config.server.metrics_path, "/metrics");
        assert!(config.providers.github.enabled);
        assert_eq!(config.providers.github.path, "/webhooks/github");
        assert_eq!(config.providers.gitlab.path, "/hooks/gl");
        assert!(!config.providers.bitbucket.enabled);
        assert_eq!(config.broker.drivers, vec!["channel", "nats"]);
        assert_eq!(config.broker.nats.url, "nats://localhost:4222");
        assert_eq!(config.broker.publish_retry.attempts, 5);
        assert_eq!(config.broker.publish_retry.delay_ms, 500);
        assert!(config.rules_strict);

        let rules = config.normalized_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].emit, vec!["pr.opened"]);
        assert_eq!(rules[1].emit, vec!["label.bug", "triage"]);
        assert_eq!(rules[1].drivers, vec!["nats"]);
    }

    #[test]
    fn parse_minimal_config() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_body_bytes, 1 << 20);
        assert_eq!(config.broker.driver, "channel");
        assert_eq!(config.broker.channel.output_buffer, 64);
        assert_eq!(config.broker.http.mode, "topic_url");
        assert_eq!(config.providers.bitbucket.path, "/webhooks/bitbucket");
        assert!(config.rules.is_empty());
        assert!(!config.rules_strict);
    }

    #[test]
    fn gochannel_alias_still_parses() {
        let yaml = r#"
watermill:
  driver: gochannel
  gochannel:
    output_buffer: 16
    persistent: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.broker.channel.output_buffer, 16);
        assert!(config.broker.channel.persistent);
    }

    #[test]
    fn env_expansion() {
        std::env::set_var("HOOKRELAY_TEST_SECRET", "s3cr3t");
        let yaml = r#"
providers:
  github:
    secret: $HOOKRELAY_TEST_SECRET
  gitlab:
    secret: "${HOOKRELAY_TEST_SECRET}"
  bitbucket:
    secret: "$HOOKRELAY_TEST_UNSET"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.providers.github.secret, "s3cr3t");
        assert_eq!(config.providers.gitlab.secret, "s3cr3t");
        assert_eq!(config.providers.bitbucket.secret, "");
    }

    #[test]
    fn empty_when_or_emit_rejected() {
        let config = Config::from_yaml("rules:\n  - when: '  '\n    emit: x\n").unwrap();
        assert!(matches!(
            config.normalized_rules(),
            Err(ConfigError::InvalidRule(0))
        ));

        let config = Config::from_yaml("rules:\n  - when: a == 1\n    emit: ''\n").unwrap();
        assert!(matches!(
            config.normalized_rules(),
            Err(ConfigError::InvalidRule(0))
        ));
    }
}
