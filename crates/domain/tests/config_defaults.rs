use gl_domain::config::{GlintConfig, LogFormat};

#[test]
fn default_debounce_is_300ms() {
    let config = GlintConfig::default();
    assert_eq!(config.drafts.debounce_ms, 300);
    assert_eq!(config.drafts.debounce().as_millis(), 300);
}

#[test]
fn default_storage_key() {
    let config = GlintConfig::default();
    assert_eq!(config.drafts.storage_key, "glint.drafts");
}

#[test]
fn partial_section_keeps_other_defaults() {
    let toml_str = r#"
[tools]
timeout_ms = 1500
"#;
    let config = GlintConfig::from_toml(toml_str).unwrap();
    assert_eq!(config.tools.timeout_ms, 1500);
    assert_eq!(config.tools.max_cached_results, 512);
    assert!(config.tools.audit_log);
}

#[test]
fn json_log_format_parses() {
    let toml_str = r#"
[observability]
format = "json"
"#;
    let config = GlintConfig::from_toml(toml_str).unwrap();
    assert_eq!(config.observability.format, LogFormat::Json);
}

#[test]
fn load_missing_file_returns_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = GlintConfig::load(&dir.path().join("nope.toml")).unwrap();
    assert_eq!(config.threads.context_key, "default");
}

#[test]
fn load_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glint.toml");
    std::fs::write(&path, "[threads]\ncontext_key = \"user-42\"\n").unwrap();
    let config = GlintConfig::load(&path).unwrap();
    assert_eq!(config.threads.context_key, "user-42");
}

#[test]
fn load_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glint.toml");
    std::fs::write(&path, "[drafts]\nstorage_key = \"  \"\n").unwrap();
    assert!(GlintConfig::load(&path).is_err());
}
