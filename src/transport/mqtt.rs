use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{distr::Alphanumeric, Rng};
use rumqttc::{AsyncClient, ClientError, ConnectionError, MqttOptions, QoS, SubscribeFilter};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::SendError, Receiver, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::{JoinError, JoinHandle},
};

use super::{IncomingMessage, OutgoingMessage, Transport, TransportError};

#[derive(Debug, Error)]
pub enum MqttClientError {
    #[error("Mqtt Client error: {0}")]
    MqttClient(#[from] ClientError),
    #[error("Error waiting for mqtt client task to complete: {0} -- {0:#?}")]
    JoinError(#[from] JoinError),
    #[error("Error sending event to mpsc channel: {0} -- {0:#?}")]
    ChannelSendError(#[from] SendError<MqttClientEvent>),
}

#[derive(Debug)]
pub enum MqttClientEvent {
    Connect,
    Disconnect,
    Stop,
    PublishMessage(IncomingMessage),
    /// The sync token requested via [`Transport::request_sync`] came back.
    SyncComplete,
    Error(ConnectionError),
}

#[derive(Debug)]
enum ClientCommand {
    Publish(OutgoingMessage),
    Subscribe(String, QoS),
    SubscribeMany(Vec<SubscribeFilter>),
    Unsubscribe(String),
    Disconnect,
}

pub struct MqttClientHandle {
    stop_sender: watch::Sender<bool>, // Shutdown signal
    handle: JoinHandle<Result<(), MqttClientError>>,
    writer: JoinHandle<()>,
}

impl MqttClientHandle {
    /// Stops the client tasks.
    pub async fn stop(self) -> Result<(), MqttClientError> {
        let _ = self.stop_sender.send(true); // Send the shutdown signal
        self.handle.await??;
        self.writer.abort();
        Ok(())
    }
}

pub fn run_mqtt_client(
    mqttoptions: MqttOptions,
    channel_size: usize,
    sync_topic: String,
) -> Result<(MqttClientHandle, ManagedMqttClient, Receiver<MqttClientEvent>), Box<MqttClientError>> {
    log::trace!("Connecting to MQTT: {}", mqttoptions.client_id());
    let (sender, receiver) = mpsc::channel(channel_size);

    let (mqtt_client, mut eventloop) = AsyncClient::new(mqttoptions, channel_size);
    let (stop_sender, mut stop_receiver) = watch::channel(false);
    let (outbox, outbox_receiver) = mpsc::unbounded_channel();

    let pending_sync = Arc::new(Mutex::new(None::<String>));
    let task_pending_sync = pending_sync.clone();
    let task_sync_topic = sync_topic.clone();
    let task_client = mqtt_client.clone();

    let handle = tokio::task::spawn(async move {
        let mut connected = false;
        loop {
            let poll_res = tokio::select! {
                poll_res = eventloop.poll() => poll_res,
                _exit = stop_receiver.changed() => {
                    if *stop_receiver.borrow() {
                        log::trace!("Received stop signal. Exiting...");
                        break;
                    }
                    continue;
                }
            };

            match poll_res {
                Ok(event) => match event {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        let payload = match String::from_utf8(p.payload.to_vec()) {
                            Ok(payload) => payload,
                            Err(err) => {
                                log::warn!(
                                    "Cannot parse mqtt payload for topic [{}] to string. Error: {}",
                                    p.topic,
                                    err
                                );
                                continue;
                            }
                        };
                        if p.topic == task_sync_topic {
                            let matched = {
                                let mut pending = task_pending_sync.lock().unwrap_or_else(PoisonError::into_inner);
                                if pending.as_deref() == Some(payload.as_str()) {
                                    pending.take();
                                    true
                                } else {
                                    false
                                }
                            };
                            if matched {
                                log::debug!("MQTT: retained backlog delivered");
                                if let Err(err) = task_client.try_unsubscribe(task_sync_topic.as_str()) {
                                    log::warn!("Cannot unsubscribe from sync topic: {}", err);
                                }
                                sender.send(MqttClientEvent::SyncComplete).await?;
                            }
                            continue;
                        }
                        let pe = IncomingMessage {
                            topic: p.topic,
                            retain: p.retain,
                            payload,
                            duplicate: p.dup,
                            qos: p.qos,
                        };
                        sender.send(MqttClientEvent::PublishMessage(pe)).await?;
                    }
                    rumqttc::Event::Incoming(rumqttc::Incoming::ConnAck(_)) => {
                        log::trace!("MQTT: Connected");
                        connected = true;
                        sender.send(MqttClientEvent::Connect).await?;
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        log::trace!("MQTT: Connection closed from our side.",);
                        sender.send(MqttClientEvent::Disconnect).await?;

                        break;
                    }
                    _ => {}
                },

                Err(err) => {
                    if connected {
                        connected = false;
                        sender.send(MqttClientEvent::Disconnect).await?;
                    }
                    log::error!("MQTTClient: Error connecting mqtt. {:#?}", err);
                    sender.send(MqttClientEvent::Error(err)).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            };
        }
        sender.send(MqttClientEvent::Stop).await?;
        log::trace!("Exiting mqtt client eventloop...");
        Ok(())
    });

    let writer = tokio::task::spawn(run_outbox_writer(mqtt_client, outbox_receiver));

    Ok((
        MqttClientHandle {
            handle,
            stop_sender,
            writer,
        },
        ManagedMqttClient::new(outbox, sync_topic, pending_sync),
        receiver,
    ))
}

/// Forwards queued commands to the client in order.
async fn run_outbox_writer(client: AsyncClient, mut outbox: UnboundedReceiver<ClientCommand>) {
    while let Some(command) = outbox.recv().await {
        let res = match command {
            ClientCommand::Publish(m) => client.publish(m.topic, m.qos, m.retain, m.payload).await,
            ClientCommand::Subscribe(topic, qos) => client.subscribe(topic, qos).await,
            ClientCommand::SubscribeMany(filters) => client.subscribe_many(filters).await,
            ClientCommand::Unsubscribe(topic) => client.unsubscribe(topic).await,
            ClientCommand::Disconnect => client.disconnect().await,
        };
        if let Err(err) = res {
            log::warn!("MQTT: error sending request to the eventloop: {}", err);
        }
    }
    log::trace!("Exiting mqtt outbox writer...");
}

#[derive(Debug, Clone)]
pub struct ManagedMqttClient {
    outbox: UnboundedSender<ClientCommand>,
    subscriptions: Arc<Mutex<HashMap<String, QoS>>>,
    sync_topic: String,
    pending_sync: Arc<Mutex<Option<String>>>,
}

impl ManagedMqttClient {
    fn new(
        outbox: UnboundedSender<ClientCommand>,
        sync_topic: String,
        pending_sync: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            outbox,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            sync_topic,
            pending_sync,
        }
    }

    fn queue(&self, command: ClientCommand) -> Result<(), TransportError> {
        self.outbox.send(command).map_err(|_| TransportError::Closed)
    }

    /// Re-issues every tracked subscription, used after a reconnect.
    pub fn resubscribe(&self) -> Result<(), TransportError> {
        let filters = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(topic, qos)| SubscribeFilter::new(topic.to_string(), *qos))
            .collect::<Vec<_>>();
        if filters.is_empty() {
            return Ok(());
        }
        self.queue(ClientCommand::SubscribeMany(filters))
    }

    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.queue(ClientCommand::Disconnect)
    }
}

impl Transport for ManagedMqttClient {
    fn publish(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        self.queue(ClientCommand::Publish(message))
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut subs = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);

        #[allow(clippy::map_entry)]
        if !subs.contains_key(topic) {
            self.queue(ClientCommand::Subscribe(topic.to_string(), QoS::AtLeastOnce))?;
            subs.insert(topic.to_string(), QoS::AtLeastOnce);
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        self.queue(ClientCommand::Unsubscribe(topic.to_string()))
    }

    fn request_sync(&self) -> Result<(), TransportError> {
        let token = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect::<String>();
        *self.pending_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        log::debug!("MQTT: requesting backlog sync on {}", self.sync_topic);
        self.queue(ClientCommand::Subscribe(self.sync_topic.clone(), QoS::AtLeastOnce))?;
        self.queue(ClientCommand::Publish(OutgoingMessage::transient(&self.sync_topic, token)))
    }
}
