use crate::transport::{Connector, OpenOutcome, Transport, TransportMessage};
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{Mutex, mpsc};
use url::Url;

pub struct ChannelTransport {
    tx: Mutex<Option<Sender<TransportMessage>>>,
    rx: Mutex<Receiver<TransportMessage>>,
}

impl ChannelTransport {
    pub fn new(tx: Sender<TransportMessage>, rx: Receiver<TransportMessage>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, data: &TransportMessage) -> anyhow::Result<()> {
        let tx = self.tx.lock().await;
        let tx = tx.as_ref().ok_or_else(|| anyhow!("channel closed"))?;
        tx.send(data.clone())
            .await
            .map_err(|e| anyhow!("send failed: {e}"))
    }

    async fn receive(&self) -> anyhow::Result<TransportMessage> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(|| anyhow!("channel closed"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}

pub fn channel_transport_pair(capacity: usize) -> (ChannelTransport, ChannelTransport) {
    let (tx1, rx1) = mpsc::channel::<TransportMessage>(capacity);
    let (tx2, rx2) = mpsc::channel::<TransportMessage>(capacity);

    let a = ChannelTransport::new(tx1, rx2); // side A
    let b = ChannelTransport::new(tx2, rx1); // side B

    (a, b)
}

pub struct ChannelConnector {
    transport: std::sync::Mutex<Option<ChannelTransport>>,
}

impl ChannelConnector {
    pub fn new(transport: ChannelTransport) -> Self {
        Self {
            transport: std::sync::Mutex::new(Some(transport)),
        }
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    async fn open(&self, target: &Url) -> OpenOutcome<ChannelTransport> {
        let transport = match self.transport.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match transport {
            Some(transport) => OpenOutcome::Opened(transport),
            None => OpenOutcome::Failed(anyhow!("channel to {target} already used")),
        }
    }
}
