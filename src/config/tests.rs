use std::io::Write;
use std::time::Duration;

use serial_test::serial;

use super::*;
use crate::cache::UntrackedKeys;

fn parse(args: &[&str]) -> CliArgs {
    CliArgs::parse_from(args)
}

fn toml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_yield_single_default_cache() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.caches.len(), 1);
    assert_eq!(
        settings.caches.get(DEFAULT_CACHE_NAME),
        Some(&ClientConfig::default())
    );
    assert_eq!(settings.select_cache(None), DEFAULT_CACHE_NAME);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.caches.insert(
        "pages".to_string(),
        RawClientConfig {
            servers: Some(vec!["10.0.0.1:11211".to_string()]),
            ..Default::default()
        },
    );

    let overrides = Overrides {
        log_level: Some("debug".to_string()),
        log_json: Some(true),
        servers: vec!["10.0.0.2:11211".to_string(), "10.0.0.3:11211".to_string()],
        default_namespace: Some("site".to_string()),
        backend: Some(BackendKind::Memory),
    };

    raw.apply_overrides(None, &overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(matches!(settings.logging.format, LogFormat::Json));
    let pages = settings.caches.get("pages").expect("pages cache");
    assert_eq!(pages.servers, vec!["10.0.0.2:11211", "10.0.0.3:11211"]);
    assert_eq!(pages.default_namespace.as_deref(), Some("site"));
    assert_eq!(pages.backend, BackendKind::Memory);
    assert_eq!(settings.select_cache(None), "pages");
}

#[test]
fn cache_overrides_create_named_entry() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        backend: Some(BackendKind::Memory),
        ..Default::default()
    };

    raw.apply_overrides(Some("fragments"), &overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.caches.len(), 1);
    assert_eq!(
        settings.caches.get("fragments").map(|c| c.backend),
        Some(BackendKind::Memory)
    );
}

#[test]
fn negative_lifetime_is_rejected() {
    let mut raw = RawSettings::default();
    raw.caches.insert(
        "pages".to_string(),
        RawClientConfig {
            default_lifetime: Some(-1),
            ..Default::default()
        },
    );

    match Settings::from_raw(raw) {
        Err(LoadError::Cache { name, source }) => {
            assert_eq!(name, "pages");
            assert!(matches!(
                source,
                CacheError::Configuration {
                    key: "default_lifetime",
                    ..
                }
            ));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn malformed_server_is_rejected() {
    let mut raw = RawSettings::default();
    raw.caches.insert(
        "pages".to_string(),
        RawClientConfig {
            servers: Some(vec!["no-port".to_string()]),
            ..Default::default()
        },
    );
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Cache { .. })
    ));
}

#[test]
fn empty_server_list_is_rejected() {
    let mut raw = RawSettings::default();
    raw.caches.insert(
        "pages".to_string(),
        RawClientConfig {
            servers: Some(Vec::new()),
            ..Default::default()
        },
    );
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "logging.level",
            ..
        })
    ));
}

#[test]
#[serial]
fn load_reads_config_file() {
    let file = toml_file(
        r#"
[logging]
level = "warn"

[caches.pages]
servers = ["127.0.0.1:11211", "127.0.0.1:11212"]
default_namespace = "site"
default_lifetime = 600
track_keys = true
timeout_ms = 250
untracked_keys = "empty"

[caches.fragments]
backend = "memory"
memory_capacity = 32
"#,
    );
    let path = file.path().to_string_lossy().into_owned();
    let args = parse(&["tagcache", "--config-file", path.as_str(), "stats"]);

    let settings = load(&args).expect("settings load");

    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.caches.len(), 2);
    let pages = settings.caches.get("pages").expect("pages cache");
    assert_eq!(pages.servers.len(), 2);
    assert_eq!(pages.default_namespace.as_deref(), Some("site"));
    assert_eq!(pages.default_lifetime, 600);
    assert!(pages.track_keys);
    assert_eq!(pages.timeout, Duration::from_millis(250));
    assert_eq!(pages.untracked_keys, UntrackedKeys::Empty);
    let fragments = settings.caches.get("fragments").expect("fragments cache");
    assert_eq!(fragments.backend, BackendKind::Memory);
    assert_eq!(fragments.memory_capacity, 32);
    assert_eq!(settings.select_cache(None), DEFAULT_CACHE_NAME);
    assert_eq!(settings.select_cache(Some("pages")), "pages");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = toml_file(
        r#"
[caches.pages]
default_lifetime = 600
"#,
    );
    let path = file.path().to_string_lossy().into_owned();
    let args = parse(&["tagcache", "--config-file", path.as_str(), "stats"]);

    // SAFETY: serialized with the other environment-reading tests.
    unsafe { std::env::set_var("TAGCACHE__CACHES__PAGES__DEFAULT_LIFETIME", "60") };
    let result = load(&args);
    unsafe { std::env::remove_var("TAGCACHE__CACHES__PAGES__DEFAULT_LIFETIME") };

    let settings = result.expect("settings load");
    assert_eq!(
        settings.caches.get("pages").map(|c| c.default_lifetime),
        Some(60)
    );
}

#[test]
#[serial]
fn missing_explicit_config_file_fails() {
    let args = parse(&[
        "tagcache",
        "--config-file",
        "/nonexistent/tagcache-test.toml",
        "stats",
    ]);
    assert!(matches!(load(&args), Err(LoadError::Build(_))));
}

#[test]
fn parse_set_arguments() {
    let args = parse(&[
        "tagcache",
        "--cache",
        "pages",
        "set",
        "front",
        r#"{"title":"hi"}"#,
        "--ns",
        "site",
        "--lifetime",
        "60",
        "--depends-on",
        "posts",
        "--depends-on",
        "tags",
    ]);

    assert_eq!(args.cache.as_deref(), Some("pages"));
    match args.command {
        Command::Set(set) => {
            assert_eq!(set.target.key, "front");
            assert_eq!(set.target.namespace.ns.as_deref(), Some("site"));
            assert!(!set.target.raw);
            assert_eq!(set.value, r#"{"title":"hi"}"#);
            assert_eq!(set.lifetime, Some(60));
            assert_eq!(set.dependencies, vec!["posts", "tags"]);
        }
        other => panic!("wrong command parsed: {other:?}"),
    }
}

#[test]
fn parse_invalidate_arguments() {
    let args = parse(&["tagcache", "invalidate", "--depends-on", "posts"]);
    match args.command {
        Command::Invalidate(invalidate) => {
            assert!(invalidate.key.is_none());
            assert_eq!(invalidate.dependencies, vec!["posts"]);
        }
        other => panic!("wrong command parsed: {other:?}"),
    }

    let args = parse(&["tagcache", "invalidate-all", "--log-json", "true"]);
    assert!(matches!(args.command, Command::InvalidateAll));
    assert_eq!(args.overrides.log_json, Some(true));
}

#[test]
fn parse_backend_override() {
    let args = parse(&["tagcache", "--backend", "memory", "keys", "--ns", "site"]);
    assert_eq!(args.overrides.backend, Some(BackendKind::Memory));
    match args.command {
        Command::Keys(keys) => assert_eq!(keys.ns.as_deref(), Some("site")),
        other => panic!("wrong command parsed: {other:?}"),
    }

    assert!(CliArgs::try_parse_from(["tagcache", "--backend", "redis", "stats"]).is_err());
}
