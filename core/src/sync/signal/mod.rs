//! A last-value-wins broadcast cell.
//!
//! Writers publish a value, readers read the latest one and can wait for the
//! next change. Writes that carry a value equal to the current one do not wake
//! readers.

mod instrumentation;

use crate::sync::signal::instrumentation::{record_set_applied, record_set_skipped};
use atomic_refcell::AtomicRefCell;
use thiserror::Error;
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug, Error)]
#[error("Signal sender dropped")]
pub struct RecvError;

pub fn signal<T: PartialEq + Clone>(name: &'static str) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = watch::channel(None);
    (
        Sender { name, tx },
        Receiver {
            name,
            rx: AtomicRefCell::new(rx),
        },
    )
}

#[derive(Clone, Debug)]
pub struct Sender<T: PartialEq + Clone> {
    name: &'static str,
    tx: watch::Sender<Option<T>>,
}

impl<T: PartialEq + Clone> Sender<T> {
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn set(&self, value: T) {
        self.replace(Some(value));
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    pub fn replace(&self, value: Option<T>) {
        let name = self.name;
        self.tx.send_if_modified(|current| {
            if *current == value {
                record_set_skipped(name);
                false
            } else {
                record_set_applied(name);
                *current = value;
                true
            }
        });
    }

    pub fn subscribe(&self) -> Receiver<T> {
        Receiver {
            name: self.name,
            rx: AtomicRefCell::new(self.tx.subscribe()),
        }
    }
}

#[derive(Debug)]
pub struct Receiver<T: PartialEq + Clone> {
    name: &'static str,
    rx: AtomicRefCell<watch::Receiver<Option<T>>>,
}

impl<T: PartialEq + Clone> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver {
            name: self.name,
            rx: AtomicRefCell::new(self.rx.borrow().clone()),
        }
    }
}

impl<T: PartialEq + Clone> Receiver<T> {
    pub fn get(&self) -> Option<T> {
        self.rx.borrow().borrow().clone()
    }

    /// Waits for the next change. A receiver is polled by one task at a time.
    pub async fn changed(&self) -> Result<(), RecvError> {
        let mut rx = self.rx.borrow().clone();
        let result = rx.changed().await;
        rx.borrow_and_update();
        *self.rx.borrow_mut() = rx;
        result.map_err(|_| {
            trace!(signal = self.name, "Sender dropped");
            RecvError
        })
    }
}
