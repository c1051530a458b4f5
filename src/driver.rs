use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time;
use tracing::{debug, info};

use crate::stack::RoadStack;

/// Services a stack periodically until `shutdown` becomes `true` (or its sender goes away).
///  The stack is shared with the application, which calls the stack's operations between ticks.
pub async fn run_service_loop(stack: Arc<Mutex<RoadStack>>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut service_ticks = time::interval(period);
    service_ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let name = stack.lock().await.local().name.clone();
    debug!("starting service loop for {} every {:?}", name, period);

    loop {
        select! {
            _ = service_ticks.tick() => {
                stack.lock().await.service_all();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("stopping service loop for {}", name);
                    break;
                }
            }
        }
    }
}
