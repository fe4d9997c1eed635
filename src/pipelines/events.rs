use std::collections::VecDeque;
use std::sync::Mutex;
use futures::Stream;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use crate::store::{Project, ProjectStatus, SequencingLayout};


/// Project settings echoed to observers with every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoedConfig {
    pub species: String,
    pub genome_reference: String,
    pub pipeline_version: String,
    pub sequencing_type: SequencingLayout,
    pub pvalue_cutoff: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub project_id: u64,
    pub status: ProjectStatus,
    pub project_name: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<EchoedConfig>,
}

impl StatusEvent {
    /// Snapshot of a project row right after a transition.
    pub fn from_project(project: &Project) -> Self {
        StatusEvent {
            project_id: project.id,
            status: project.status,
            project_name: project.name.clone(),
            session_id: project.session_id.clone(),
            error_message: if project.status == ProjectStatus::Failed {
                project.error_message.clone()
            } else {
                None
            },
            config: Some(EchoedConfig {
                species: project.species.clone(),
                genome_reference: project.genome_reference.clone(),
                pipeline_version: project.pipeline_version.clone(),
                sequencing_type: project.sequencing_type,
                pvalue_cutoff: project.pvalue_cutoff,
            }),
        }
    }
}


/// Subscription key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Project(u64),
    Session(String),
}

impl Topic {
    pub fn matches(&self, event: &StatusEvent) -> bool {
        match self {
            Topic::Project(id) => event.project_id == *id,
            Topic::Session(session) => &event.session_id == session,
        }
    }
}


pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, event: StatusEvent);
}


struct PublisherState {
    sender: broadcast::Sender<StatusEvent>,
    history: VecDeque<StatusEvent>,
}

/// In-process fan-out over a broadcast channel. A bounded history is replayed
/// to new subscribers, so nobody has to be listening before a run starts.
pub struct BroadcastPublisher {
    capacity: usize,
    state: Mutex<PublisherState>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        BroadcastPublisher {
            capacity,
            state: Mutex::new(PublisherState { sender, history: VecDeque::with_capacity(capacity) }),
        }
    }

    /// Replays matching history, then follows live events.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        // Snapshot and receiver are taken under the publish lock: no gap, no duplicate.
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let backlog = state.history.iter().filter(|e| topic.matches(e)).cloned().collect();
        let receiver = state.sender.subscribe();
        Subscription { topic, backlog, receiver }
    }
}

impl NotificationPublisher for BroadcastPublisher {
    fn publish(&self, event: StatusEvent) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.history.len() == self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // No receivers is fine; the history still has it.
        let _ = state.sender.send(event);
    }
}


pub struct Subscription {
    topic: Topic,
    backlog: VecDeque<StatusEvent>,
    receiver: broadcast::Receiver<StatusEvent>,
}

impl Subscription {
    /// Next matching event; `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<StatusEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.topic.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => warn!("Subscriber lagged, skipped {} events", skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Everything already delivered, without waiting.
    pub fn drain_ready(&mut self) -> Vec<StatusEvent> {
        let mut events: Vec<StatusEvent> = self.backlog.drain(..).collect();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.topic.matches(&event) {
                        events.push(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => warn!("Subscriber lagged, skipped {} events", skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        events
    }

    /// Backlog followed by live events as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> + Send + 'static {
        let topic = self.topic;
        let backlog = tokio_stream::iter(self.backlog);
        let live = BroadcastStream::new(self.receiver).filter_map(move |item| match item {
            Ok(event) if topic.matches(&event) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Subscriber lagged, skipped {} events", skipped);
                None
            }
        });
        backlog.chain(live)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn event(project_id: u64, session: &str, status: ProjectStatus) -> StatusEvent {
        StatusEvent {
            project_id,
            status,
            project_name: format!("p{}", project_id),
            session_id: session.to_string(),
            error_message: None,
            config: None,
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_then_live() {
        let publisher = BroadcastPublisher::new(16);
        publisher.publish(event(1, "s", ProjectStatus::Pending));
        publisher.publish(event(2, "s", ProjectStatus::Pending));
        publisher.publish(event(1, "s", ProjectStatus::Processing));

        let mut sub = publisher.subscribe(Topic::Project(1));
        publisher.publish(event(1, "s", ProjectStatus::Aligning));

        let statuses: Vec<ProjectStatus> = sub.drain_ready().into_iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![ProjectStatus::Pending, ProjectStatus::Processing, ProjectStatus::Aligning]
        );
    }

    #[tokio::test]
    async fn test_session_topic_and_stream() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish(event(1, "a", ProjectStatus::Pending));
        publisher.publish(event(2, "b", ProjectStatus::Pending));
        let sub = publisher.subscribe(Topic::Session("b".to_string()));
        publisher.publish(event(3, "b", ProjectStatus::Completed));
        drop(publisher);

        let events: Vec<StatusEvent> = sub.into_stream().collect().await;
        let ids: Vec<u64> = events.iter().map(|e| e.project_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let publisher = BroadcastPublisher::new(2);
        for status in [ProjectStatus::Pending, ProjectStatus::Processing, ProjectStatus::Aligning] {
            publisher.publish(event(1, "s", status));
        }
        let mut sub = publisher.subscribe(Topic::Project(1));
        assert_eq!(sub.next().await.map(|e| e.status), Some(ProjectStatus::Processing));
        assert_eq!(sub.next().await.map(|e| e.status), Some(ProjectStatus::Aligning));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(event(7, "s", ProjectStatus::DifferentialExpression)).unwrap();
        assert_eq!(json["status"], "differential_expression");
        assert!(json.get("error_message").is_none());
    }
}
