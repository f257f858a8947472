use tracing::{info, warn};

/// Pin the calling thread to the given CPU core
pub fn pin_current_thread(core: usize) -> bool {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!("Could not enumerate CPU cores, not pinning");
        return false;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            info!("Pinned {:?} to core {}", std::thread::current().name(), core);
            true
        }
        Some(_) => {
            warn!("Failed to pin thread to core {}", core);
            false
        }
        None => {
            warn!("Core {} does not exist, not pinning", core);
            false
        }
    }
}

/// Extract a readable message from a caught panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
