//! Virtual route configuration (section 6's `routing` group).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RouteBindingSpec {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Accepts either the shorthand single-binding form (`{provider, model}`) or
/// the explicit list form used when a route fans out across several bindings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RouteConfig {
    Single(RouteBindingSpec),
    Multi(Vec<RouteBindingSpec>),
}

impl RouteConfig {
    pub fn into_bindings(self) -> Vec<RouteBindingSpec> {
        match self {
            RouteConfig::Single(b) => vec![b],
            RouteConfig::Multi(bs) => bs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_binding_shorthand() {
        let cfg: RouteConfig = toml::from_str(
            r#"provider = "shuaihong-openai"
model = "gpt-4o-mini""#,
        )
        .unwrap();
        let bindings = cfg.into_bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].provider, "shuaihong-openai");
    }
}
