use gl_domain::config::GlintConfig;

/// Validate the config, printing the outcome.  Returns whether it is valid.
pub fn validate(config: &GlintConfig, config_path: &str) -> bool {
    match config.validate() {
        Ok(()) => {
            println!("Config OK ({config_path})");
            true
        }
        Err(e) => {
            println!("{e}");
            println!("\n1 error(s) in {config_path}");
            false
        }
    }
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &GlintConfig) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)?;
    print!("{output}");
    Ok(())
}
