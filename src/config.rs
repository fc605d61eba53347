use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::Parser;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::Schedule;

#[derive(Parser, Debug)]
#[command(name = "recharge-engine", version, about = "Prepaid SIM recharge engine")]
pub struct Args {
    /// Postgres connection string for the system of record.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Max DB pool connections.
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 20)]
    pub database_max_connections: u32,

    /// Redis connection string backing the distributed lock.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    /// Directory holding the per-service queue files.
    #[arg(long, env = "QUEUE_DIR", default_value = "./queues")]
    pub queue_dir: PathBuf,

    /// Lock TTL in minutes (spec LOCK_EXPIRATION_MINUTES).
    #[arg(long, env = "LOCK_EXPIRATION_MINUTES", default_value_t = 60)]
    pub lock_expiration_minutes: u64,

    /// GPS reporting-freshness threshold in minutes; also the GPS interval cadence.
    #[arg(long, env = "GPS_MINUTOS_SIN_REPORTAR", default_value_t = 10)]
    pub gps_minutos_sin_reportar: i64,

    /// GPS activity cap in days.
    #[arg(long, env = "GPS_DIAS_SIN_REPORTAR", default_value_t = 14)]
    pub gps_dias_sin_reportar: i64,

    /// ELIOT reporting-freshness threshold in minutes.
    #[arg(long, env = "ELIOT_MINUTOS_SIN_REPORTAR", default_value_t = 10)]
    pub eliot_minutos_sin_reportar: i64,

    /// `fixed` (default: 01:00 and 04:00) or `interval`.
    #[arg(long, env = "VOZ_SCHEDULE_MODE", default_value = "fixed")]
    pub voz_schedule_mode: String,

    /// Interval value (minutes) when VOZ_SCHEDULE_MODE=interval.
    #[arg(long, env = "VOZ_MINUTOS_SIN_REPORTAR", default_value_t = 180)]
    pub voz_minutos_sin_reportar: i64,

    /// Operational timezone, e.g. America/Mazatlan.
    #[arg(long, env = "TIMEZONE", default_value = "America/Mazatlan")]
    pub timezone: String,

    /// Identity recorded as `actor` on Settlement rows.
    #[arg(long, env = "RECHARGE_ACTOR", default_value = "recharge-engine")]
    pub actor: String,

    /// Run a single tick per service and exit, instead of scheduling forever.
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub schedule: Schedule,
    pub minutes_threshold: i64,
    pub activity_cap_days: i64,
    pub revalidation_window_days: i64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub queue_dir: PathBuf,
    pub lock_ttl: Duration,
    pub timezone: Tz,
    pub actor: String,
    pub once: bool,
    pub gps: ServiceConfig,
    pub voz: ServiceConfig,
    pub eliot: ServiceConfig,
}

impl AppConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.gps_minutos_sin_reportar < 6 {
            tracing::warn!(
                value = args.gps_minutos_sin_reportar,
                "GPS_MINUTOS_SIN_REPORTAR below the production minimum of 6"
            );
        }

        let timezone = Tz::from_str(&args.timezone)
            .map_err(|_| eyre!("invalid timezone '{}': not a valid IANA zone name", args.timezone))?;

        let voz_schedule = match args.voz_schedule_mode.as_str() {
            "fixed" => Schedule::FixedTimes(vec![(1, 0), (4, 0)]),
            "interval" => Schedule::IntervalMinutes(args.voz_minutos_sin_reportar.max(1) as u32),
            other => {
                return Err(eyre!(
                    "invalid VOZ_SCHEDULE_MODE '{}': expected fixed|interval",
                    other
                ))
            }
        };

        if args.database_max_connections == 0 {
            return Err(eyre!("DATABASE_MAX_CONNECTIONS must be > 0"));
        }

        Ok(AppConfig {
            database_url: args.database_url,
            database_max_connections: args.database_max_connections,
            redis_url: args.redis_url,
            queue_dir: args.queue_dir,
            lock_ttl: Duration::from_secs(args.lock_expiration_minutes.max(1) * 60),
            timezone,
            actor: args.actor,
            once: args.once,
            gps: ServiceConfig {
                schedule: Schedule::IntervalMinutes(args.gps_minutos_sin_reportar.max(1) as u32),
                minutes_threshold: args.gps_minutos_sin_reportar,
                activity_cap_days: args.gps_dias_sin_reportar,
                revalidation_window_days: 6,
            },
            voz: ServiceConfig {
                schedule: voz_schedule,
                minutes_threshold: 0,
                activity_cap_days: i64::MAX,
                revalidation_window_days: 28,
            },
            eliot: ServiceConfig {
                schedule: Schedule::IntervalMinutes(args.eliot_minutos_sin_reportar.max(1) as u32),
                minutes_threshold: args.eliot_minutos_sin_reportar,
                activity_cap_days: 14,
                revalidation_window_days: 6,
            },
        })
    }
}

/// End of the current day in `tz`, expressed as a UTC instant (spec §3, §4.7).
pub fn end_of_today(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let end_naive = local
        .date_naive()
        .and_hms_opt(23, 59, 59)
        .expect("23:59:59 is always valid");
    tz.from_local_datetime(&end_naive)
        .single()
        .unwrap_or(local)
        .with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Mazatlan;

    #[test]
    fn end_of_today_is_after_now() {
        let now = Utc::now();
        let eod = end_of_today(now, Mazatlan);
        assert!(eod >= now);
    }
}
