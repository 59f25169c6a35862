//! Config serialization to TOML.
//!
//! Single source of truth for the config file format; `config show` and the
//! `config` subcommand's `--help` text both read from here indirectly.

use super::Config;

impl Config {
    fn providers_to_toml(&self) -> String {
        if self.providers.is_empty() {
            return r#"
# [providers.anthropic-direct]
# type = "openai"
# endpoint = "https://api.example.com/v1/chat/completions"
# [providers.anthropic-direct.authentication]
# type = "bearer"
# [providers.anthropic-direct.authentication.credentials]
# apiKey = ["sk-key-one", "sk-key-two"]
# [providers.anthropic-direct.keyRotation]
# strategy = "round_robin"
# cooldownMs = 30000
"#
            .to_string();
        }

        let mut output = String::from("\n");
        let mut keys: Vec<_> = self.providers.keys().collect();
        keys.sort();
        for name in keys {
            let provider = &self.providers[name];
            output.push_str(&format!("[providers.{}]\n", name));
            output.push_str(&format!("endpoint = \"{}\"\n", provider.endpoint));
            output.push_str(&format!(
                "# {} configured credential(s), keyRotation strategy = {:?}\n\n",
                provider.authentication.credentials.api_key.clone().into_vec().len(),
                provider.key_rotation.strategy,
            ));
        }
        output
    }

    fn routes_to_toml(&self) -> String {
        if self.routing.routes.is_empty() {
            return r#"
# [routing.routes.default]
# provider = "anthropic-direct"
# model = "claude-sonnet-4-5"
#
# [[routing.routes.opus]]
# provider = "anthropic-direct"
# model = "claude-opus-4"
# priority = 10
"#
            .to_string();
        }

        let mut output = String::from("\n");
        let mut keys: Vec<_> = self.routing.routes.keys().collect();
        keys.sort();
        for name in keys {
            output.push_str(&format!("# [routing.routes.{}] (configured)\n", name));
        }
        output
    }

    /// Serialize config to TOML string (single source of truth for format).
    pub fn to_toml(&self) -> String {
        format!(
            r#"# llm-gateway configuration

[server]
bind_addr = "{bind}"

[debug]
enabled = {debug_enabled}
logLevel = "{log_level}"
traceRequests = {trace_requests}
{log_dir_line}
[routing]
looseOrdering = {loose_ordering}
{routes_section}
# ─────────────────────────────────────────────────────────────────────────────
# PROVIDERS
# ─────────────────────────────────────────────────────────────────────────────
# Each provider names a dialect (openai, gemini, codewhisperer, lmstudio),
# an endpoint, and an authentication block. `credentials.apiKey` accepts a
# single string or an array; an array feeds the credential pool's rotation.
{providers_section}
"#,
            bind = self.server.bind_addr,
            debug_enabled = self.debug.enabled,
            log_level = self.debug.log_level,
            trace_requests = self.debug.trace_requests,
            log_dir_line = self
                .debug
                .log_dir
                .as_ref()
                .map(|d| format!("logDir = \"{}\"\n", d.display()))
                .unwrap_or_else(|| "# logDir = \"./logs\"\n".to_string()),
            loose_ordering = self.routing.loose_ordering,
            routes_section = self.routes_to_toml(),
            providers_section = self.providers_to_toml(),
        )
    }
}
