use std::{num::NonZeroU8, panic};

use anyhow::Result;
use time::format_description::well_known::{
    iso8601::{self, EncodedConfig},
    Iso8601,
};
use tracing::error;
use tracing_subscriber::{
    fmt::{
        self,
        format::{Compact, DefaultFields, Format},
        time::{FormatTime, LocalTime, SystemTime},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer, Registry,
};

fn default_subscriber_builder() -> fmt::Layer<Registry, DefaultFields, Format<Compact>> {
    const WITH_FILE_PATH: bool = cfg!(debug_assertions);
    fmt::layer()
        .compact()
        .with_file(WITH_FILE_PATH)
        .with_line_number(WITH_FILE_PATH)
        .with_target(!WITH_FILE_PATH)
        .with_thread_ids(true)
}

type ServerLayer<T> = fmt::Layer<Registry, DefaultFields, Format<Compact, T>>;

fn default_filter() -> EnvFilter {
    let level = if cfg!(debug_assertions) {
        "trace"
    } else {
        "info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={level},duocall_lib={level},tower_http=debug",
            env!("CARGO_CRATE_NAME"),
        ))
    })
}

fn init_tracing<T: FormatTime + Send + Sync + 'static>(
    customize: fn(ServerLayer<SystemTime>) -> ServerLayer<T>,
) -> Result<()> {
    let layer = customize(default_subscriber_builder());
    let reg = tracing_subscriber::registry().with(layer.with_filter(default_filter()));
    tracing::subscriber::set_global_default(reg)?;
    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(())
}

pub fn init_local_tracing() -> Result<()> {
    const MY_CONFIG: EncodedConfig = iso8601::Config::DEFAULT
        .set_time_precision(iso8601::TimePrecision::Second {
            decimal_digits: NonZeroU8::new(6),
        })
        .encode();
    init_tracing(|layer| layer.with_timer(LocalTime::new(Iso8601::<MY_CONFIG>)))
}

/// Plain output for log collectors: no timestamps, no colors.
pub fn init_server_tracing() -> Result<()> {
    init_tracing(|layer| layer.without_time().with_ansi(false))
}
