// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MSI-X interrupt delivery for user-mode device drivers.

use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use tokio::sync::Notify;

type Targets = Arc<Mutex<Vec<Weak<Target>>>>;

/// A mapped device interrupt.
///
/// Signals are edge triggered and coalesce: any number of signals that
/// arrive while nobody waits wake the next [`wait`](Self::wait) once.
///
/// Cloning produces an independent target on the same vector that starts out
/// unsignaled.
pub struct DeviceInterrupt {
    target: Arc<Target>,
    targets: Targets,
}

struct Target {
    notify: Notify,
    signals: AtomicU64,
}

fn attach(targets: &Targets) -> DeviceInterrupt {
    let target = Arc::new(Target {
        notify: Notify::new(),
        signals: AtomicU64::new(0),
    });
    targets.lock().push(Arc::downgrade(&target));
    DeviceInterrupt {
        target,
        targets: targets.clone(),
    }
}

impl Clone for DeviceInterrupt {
    fn clone(&self) -> Self {
        attach(&self.targets)
    }
}

impl DeviceInterrupt {
    /// Waits for the interrupt to be signaled.
    pub async fn wait(&mut self) {
        self.target.notify.notified().await
    }

    /// The number of times this target has been signaled.
    pub fn signal_count(&self) -> u64 {
        self.target.signals.load(Ordering::Relaxed)
    }
}

/// The device side of an interrupt vector, used by device backends to signal
/// every [`DeviceInterrupt`] mapped to it.
#[derive(Default)]
pub struct DeviceInterruptSource {
    targets: Targets,
}

impl DeviceInterruptSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a new target onto this vector.
    pub fn new_target(&self) -> DeviceInterrupt {
        attach(&self.targets)
    }

    /// The number of live targets.
    pub fn target_count(&self) -> usize {
        self.targets
            .lock()
            .iter()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// Signals every live target, forgetting the dropped ones.
    pub fn signal(&self) {
        self.targets.lock().retain(|target| match target.upgrade() {
            Some(target) => {
                target.signals.fetch_add(1, Ordering::Relaxed);
                target.notify.notify_one();
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceInterruptSource;
    use std::time::Duration;

    #[tokio::test]
    async fn signals_coalesce() {
        let source = DeviceInterruptSource::new();
        let mut target = source.new_target();
        source.signal();
        source.signal();
        target.wait().await;
        assert_eq!(target.signal_count(), 2);
        tokio::time::timeout(Duration::from_millis(10), target.wait())
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn clones_are_independent() {
        let source = DeviceInterruptSource::new();
        let mut target = source.new_target();
        source.signal();
        let mut clone = target.clone();
        let task = tokio::spawn(async move { clone.wait().await });
        source.signal();
        task.await.unwrap();
        target.wait().await;
        assert_eq!(target.signal_count(), 2);
    }

    #[tokio::test]
    async fn dropped_targets_are_forgotten() {
        let source = DeviceInterruptSource::new();
        let mut kept = source.new_target();
        drop(source.new_target());
        assert_eq!(source.target_count(), 1);
        source.signal();
        tokio::time::timeout(Duration::from_secs(5), kept.wait())
            .await
            .unwrap();
    }
}
