use std::{process, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use tagcache::{
    cache::{
        ClientRegistry, EventQueue, Invalidation, InvalidationDispatcher, InvalidationEvent,
        KeyPart, LoggingPurgeClient, MemcacheClient, PurgeScope, QueryOptions, SetOptions,
        VarnishInvalidation,
    },
    config::{self, Command, InvalidateArgs, KeyArgs, SetArgs},
    error::AppError,
    telemetry,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let registry = Arc::new(ClientRegistry::from_configs(settings.caches.clone())?);
    let name = settings.select_cache(cli_args.cache.as_deref()).to_string();

    if let Command::Purge(args) = &cli_args.command {
        return run_purge(registry, args.paths.clone()).await;
    }

    let client = registry
        .get(&name)
        .ok_or_else(|| AppError::validation(format!("no cache named `{name}` is configured")))?;

    match cli_args.command {
        Command::Stats => print_json(&client.get_statistics().await),
        Command::Get(args) => run_get(&client, args).await,
        Command::Set(args) => run_set(&client, args).await,
        Command::Invalidate(args) => run_invalidate(&client, args).await,
        Command::InvalidateAll => {
            client.invalidate_all().await?;
            info!(cache = %name, "Cache flushed");
            print_json(&serde_json::json!({ "cache": name, "flushed": true }))
        }
        Command::Keys(args) => print_json(&client.keys(args.ns.map(KeyPart::from))?),
        Command::Purge(_) => Ok(()),
    }
}

async fn run_get(client: &MemcacheClient, args: KeyArgs) -> Result<(), AppError> {
    let mut options = QueryOptions::new();
    if let Some(ns) = args.namespace.ns {
        options = options.ns(ns);
    }
    if args.raw {
        options = options.raw();
    }

    let value: Option<Value> = client.query(args.key, options).await?;
    print_json(&value)
}

async fn run_set(client: &MemcacheClient, args: SetArgs) -> Result<(), AppError> {
    let SetArgs {
        target,
        value,
        lifetime,
        dependencies,
    } = args;

    let mut options = SetOptions::new();
    if let Some(ns) = target.namespace.ns {
        options = options.ns(ns);
    }
    if target.raw {
        options = options.raw();
    }
    if let Some(seconds) = lifetime {
        options = options.lifetime(seconds);
    }
    for tag in dependencies {
        options = options.depends_on(tag);
    }

    // Bare text that is not JSON is stored as a string.
    let data = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
    let composed = client.set(&data, target.key, options).await?;
    print_json(&serde_json::json!({ "key": composed }))
}

async fn run_invalidate(client: &MemcacheClient, args: InvalidateArgs) -> Result<(), AppError> {
    let mut request = Invalidation::dependencies(args.dependencies);
    request.key = args.key.map(KeyPart::from);
    if let Some(ns) = args.namespace.ns {
        request = request.ns(ns);
    }
    if args.raw {
        request = request.raw();
    }

    let removed = client.invalidate(request).await?;
    print_json(&serde_json::json!({ "removed": removed }))
}

async fn run_purge(registry: Arc<ClientRegistry>, paths: Vec<String>) -> Result<(), AppError> {
    let scope = if paths.is_empty() {
        PurgeScope::All
    } else {
        PurgeScope::Paths(paths)
    };
    let dispatcher = InvalidationDispatcher::new(
        registry,
        Arc::new(LoggingPurgeClient),
        Arc::new(EventQueue::new()),
    );

    let report = dispatcher
        .dispatch(&InvalidationEvent::Varnish(VarnishInvalidation { scope }))
        .await;
    if let Some(failure) = report.failures.first() {
        return Err(AppError::unexpected(failure.error.to_string()));
    }
    print_json(&serde_json::json!({ "purged": true }))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
