use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use duocall_lib::signaling_server::relay::Relay;
use tokio::{
    spawn,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, trace};

pub fn spawn_sweeper(relay: Arc<Relay>, ttl: Duration, period: Duration) -> JoinHandle<()> {
    spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = relay.sweep(Instant::now(), ttl).await;
            if evicted > 0 {
                info!("[Sweeper] Evicted {} idle calls", evicted);
            } else {
                trace!("[Sweeper] Nothing to evict");
            }
        }
    })
}
