use super::{json_pretty, EXIT_SUCCESS};
use bridgekeeper_core::CoreConfig;

const REDACTED: &str = "<redacted>";

pub fn run(config: &CoreConfig, json: bool) -> Result<u8, String> {
    let shown = redact(config);
    if json {
        println!("{}", json_pretty(&shown)?);
    } else {
        let text = toml::to_string_pretty(&shown)
            .map_err(|e| format!("TOML serialization failed: {e}"))?;
        print!("{text}");
    }
    Ok(EXIT_SUCCESS)
}

fn redact(config: &CoreConfig) -> CoreConfig {
    let mut shown = config.clone();
    if let Some(auth) = shown.registry.as_mut() {
        REDACTED.clone_into(&mut auth.password);
    }
    if let Some(token) = shown.catalog.as_mut().and_then(|c| c.auth_token.as_mut()) {
        REDACTED.clone_into(token);
    }
    shown
}
