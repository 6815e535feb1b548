//! Broadcast handler: the only owner of the fan-out set.
//!
//! Ordinary deliveries are handed to a spawned task that writes to a snapshot
//! of the members concurrently, so one slow peer never stalls the others and
//! the set itself is only ever touched by this actor. Failed writes are
//! reported back to the server as [`Event::DeadConnection`]. The shutdown
//! notice is the exception: it waits for every delivery still in flight, then
//! is written member by member and awaited before any connection is closed.

use std::collections::HashMap;

use futures_util::future::join_all;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, info};

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    event::{Dispatch, Event},
};

pub struct Handler {
    members: HashMap<ConnectionId, ConnectionHandle>,
    deliveries: JoinSet<()>,
    events: mpsc::Sender<Event>,
}

impl Handler {
    /// `events` is the server's inbound channel, used to report dead peers.
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        Self {
            members: HashMap::new(),
            deliveries: JoinSet::new(),
            events,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<Dispatch>) {
        while let Some(dispatch) = inbox.recv().await {
            while self.deliveries.try_join_next().is_some() {}
            match dispatch {
                Dispatch::Joined { connection, text } => {
                    self.members.insert(connection.id(), connection);
                    self.fan_out(text);
                }
                Dispatch::Left { id, text } => {
                    if let Some(connection) = self.members.remove(&id) {
                        self.deliveries.spawn(async move { connection.close().await });
                    }
                    self.fan_out(text);
                }
                Dispatch::Broadcast { sender, text } => {
                    debug!(connection = %sender, members = self.members.len(), "fanning out");
                    self.fan_out(text);
                }
                Dispatch::Direct { id, text } => match self.members.get(&id) {
                    Some(connection) => {
                        let targets = vec![connection.clone()];
                        self.deliveries.spawn(deliver(targets, text, self.events.clone()));
                    }
                    None => debug!(connection = %id, "dropping direct message for unknown connection"),
                },
                Dispatch::Shutdown { text } => {
                    self.drain(&text).await;
                    return;
                }
            }
        }

        debug!("dispatch channel closed; closing remaining connections");
        self.settle().await;
        for (_, connection) in self.members.drain() {
            connection.close().await;
        }
    }

    fn fan_out(&mut self, text: String) {
        if self.members.is_empty() {
            return;
        }
        let targets = self.members.values().cloned().collect();
        self.deliveries.spawn(deliver(targets, text, self.events.clone()));
    }

    /// Waits for every delivery still in flight. Each write is bounded by its
    /// connection's write timeout.
    async fn settle(&mut self) {
        while let Some(result) = self.deliveries.join_next().await {
            if let Err(err) = result {
                debug!(error = %err, "delivery task did not finish");
            }
        }
    }

    async fn drain(&mut self, text: &str) {
        self.settle().await;
        info!(members = self.members.len(), "delivering shutdown notice");
        for connection in self.members.values() {
            if let Err(err) = connection.write(text).await {
                debug!(connection = %connection.id(), error = %err, "shutdown notice not delivered");
            }
        }
        for (_, connection) in self.members.drain() {
            connection.close().await;
        }
    }
}

async fn deliver(targets: Vec<ConnectionHandle>, text: String, events: mpsc::Sender<Event>) {
    let text = text.as_str();
    let attempts = targets
        .iter()
        .map(|connection| async move { (connection.id(), connection.write(text).await) });

    for (id, result) in join_all(attempts).await {
        if let Err(err) = result {
            debug!(connection = %id, error = %err, "delivery failed");
            if events.send(Event::DeadConnection { id }).await.is_err() {
                return;
            }
        }
    }
}
