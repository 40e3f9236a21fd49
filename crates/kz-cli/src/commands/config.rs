use kz_core::{AiConfig, Config};

/// Print the effective configuration as TOML. Inline API keys are masked.
pub fn run(config: &Config, preset: Option<&str>) -> anyhow::Result<()> {
    print!("{}", render(config, preset)?);
    Ok(())
}

fn render(config: &Config, preset: Option<&str>) -> anyhow::Result<String> {
    let mut shown = config.clone();
    if let Some(name) = preset {
        let Some(ai) = AiConfig::preset(name) else {
            anyhow::bail!("unknown preset {name:?} (available: {})", AiConfig::PRESETS.join(", "));
        };
        shown.ai = ai;
    }
    if shown.ai.api_key.is_some() {
        shown.ai.api_key = Some("<redacted>".into());
    }
    Ok(shown.to_toml()?)
}
