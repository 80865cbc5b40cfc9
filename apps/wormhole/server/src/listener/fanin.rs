use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{next_connection, Accepted, Binding, Listener, ListenerError, ListenerFactory};
use crate::store::Endpoint;

const FANIN_BUFFER: usize = 32;

/// Presents several factories as one: a session gets one listener from each
/// and accepts from whichever delivers first.
pub struct FanInFactory {
    factories: Vec<Arc<dyn ListenerFactory>>,
    accept_deadline: Duration,
}

impl FanInFactory {
    pub fn new(factories: Vec<Arc<dyn ListenerFactory>>, accept_deadline: Duration) -> Self {
        Self {
            factories,
            accept_deadline,
        }
    }
}

#[async_trait]
impl ListenerFactory for FanInFactory {
    async fn listen(&self, binding: &Binding) -> Result<Box<dyn Listener>, ListenerError> {
        let mut children: Vec<Arc<dyn Listener>> = Vec::with_capacity(self.factories.len());
        for factory in &self.factories {
            match factory.listen(binding).await {
                Ok(child) => children.push(Arc::from(child)),
                Err(err) => {
                    for child in &children {
                        child.close();
                    }
                    return Err(err);
                }
            }
        }

        let (tx, rx) = mpsc::channel(FANIN_BUFFER);
        let closed = CancellationToken::new();
        for child in &children {
            let child = Arc::clone(child);
            let tx = tx.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = closed.cancelled() => break,
                        accepted = next_connection(child.as_ref()) => accepted,
                    };
                    let Some(accepted) = accepted else { break };
                    if tx.send(accepted).await.is_err() {
                        break;
                    }
                }
                debug!("fan-in child loop finished");
            });
        }

        Ok(Box::new(FanInListener {
            children,
            rx: Mutex::new(rx),
            closed,
            accept_deadline: self.accept_deadline,
        }))
    }
}

struct FanInListener {
    children: Vec<Arc<dyn Listener>>,
    rx: Mutex<mpsc::Receiver<Accepted>>,
    closed: CancellationToken,
    accept_deadline: Duration,
}

#[async_trait]
impl Listener for FanInListener {
    async fn accept(&self) -> Result<Accepted, ListenerError> {
        if self.closed.is_cancelled() {
            return Err(ListenerError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ListenerError::Closed),
            next = timeout(self.accept_deadline, rx.recv()) => match next {
                Err(_) => Err(ListenerError::Timeout),
                Ok(Some(accepted)) => Ok(accepted),
                Ok(None) => Err(ListenerError::Closed),
            },
        }
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.children
            .iter()
            .flat_map(|child| child.endpoints())
            .collect()
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        for child in self.children.iter().filter(|child| child.should_cleanup()) {
            child.close();
        }
    }
}
