//! Reconciles a small fleet of pods against a fake cluster API.
//!
//! Each pod key is serialized through a `ResourceGate`. Reads suspend until
//! the fake client's callback thread answers, conflicts are retried with
//! backoff, and a domain-wide status check fans out one branch per pod.

use async_trait::async_trait;
use spindle::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A cluster API whose calls complete on another thread.
#[derive(Debug, Default)]
struct FakeClient {
    pods: Mutex<HashMap<String, String>>,
    conflicts: AtomicU32,
}

impl FakeClient {
    fn read_pod(self: &Arc<Self>, name: String, resumer: Resumer) {
        let client = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let phase = client.pods.lock().ok().and_then(|pods| pods.get(&name).cloned());
            let mut update = Context::new();
            if let Some(phase) = phase {
                update.insert("phase", phase);
            }
            if let Err(e) = resumer.complete(update) {
                tracing::warn!("read of {} came back too late: {}", name, e);
            }
        });
    }

    fn replace_pod(&self, name: &str) -> Result<(), String> {
        // every other write conflicts once
        if self.conflicts.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(format!("409 conflict on {}", name));
        }
        if let Ok(mut pods) = self.pods.lock() {
            pods.insert(name.to_string(), "Running".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ReadPod {
    client: Arc<FakeClient>,
}

#[async_trait]
impl Step for ReadPod {
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
        let name = pod_name(ctx)?;
        let client = self.client.clone();
        let next = WritePod {
            client: self.client.clone(),
            policy: RetryPolicy::exponential(4, Duration::from_millis(10)),
        };
        Ok(Action::Suspend(
            Suspension::new(next, move |resumer| client.read_pod(name, resumer))
                .with_timeout(Duration::from_secs(5)),
        ))
    }
}

#[derive(Debug, Clone)]
struct WritePod {
    client: Arc<FakeClient>,
    policy: RetryPolicy,
}

#[async_trait]
impl Step for WritePod {
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
        if ctx.get::<String>("phase").map(String::as_str) == Some("Running") {
            return Ok(Action::Done);
        }
        let name = pod_name(ctx)?;
        match self.client.replace_pod(&name) {
            Ok(()) => Ok(Action::Done),
            Err(conflict) => {
                tracing::info!("{}, retrying", conflict);
                self.policy.retry(ctx, Arc::new(self.clone()))
            }
        }
    }
}

#[derive(Debug)]
struct CheckDomain {
    client: Arc<FakeClient>,
    pods: Vec<String>,
}

#[async_trait]
impl Step for CheckDomain {
    async fn execute(&self, _ctx: &mut Context) -> Result<Action, WorkflowError> {
        let branches = self
            .pods
            .iter()
            .map(|pod| {
                let mut ctx = Context::new();
                ctx.insert("pod", pod.clone());
                Branch::new(
                    ReadPod {
                        client: self.client.clone(),
                    },
                    ctx,
                )
            })
            .collect();
        Ok(Action::fan_out(branches, Summarize))
    }
}

#[derive(Debug)]
struct Summarize;

#[async_trait]
impl Step for Summarize {
    async fn execute(&self, ctx: &mut Context) -> Result<Action, WorkflowError> {
        let results = ctx.fan_out_results().unwrap_or_default();
        let healthy = results.iter().filter(|r| r.outcome.is_completed()).count();
        println!("Domain check: {}/{} pods reconciled", healthy, results.len());
        Ok(Action::Done)
    }
}

fn pod_name(ctx: &Context) -> Result<String, WorkflowError> {
    ctx.get::<String>("pod")
        .cloned()
        .ok_or_else(|| WorkflowError::step("ReadPod", "no pod name in context"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let client = Arc::new(FakeClient::default());
    let scheduler = Scheduler::new(SchedulerConfig::default().with_name("demo"))?;
    let gate = ResourceGate::new(scheduler.clone());
    let pods: Vec<String> = (0..3).map(|i| format!("default/web-{}", i)).collect();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    // two events per pod; the second waits behind the first
    for pod in pods.iter().chain(pods.iter()) {
        let mut ctx = Context::new();
        ctx.insert("pod", pod.clone());
        let done_tx = done_tx.clone();
        let pod_key = pod.clone();
        let admission = gate.admit_or_queue(
            pod.clone(),
            Arc::new(ReadPod {
                client: client.clone(),
            }),
            ctx,
            move |outcome| {
                let _ = done_tx.send((pod_key, outcome));
            },
        );
        println!("{}: {:?}", pod, admission);
    }
    drop(done_tx);

    while let Some((pod, outcome)) = done_rx.recv().await {
        match outcome {
            Outcome::Completed(_) => println!("{} reconciled", pod),
            Outcome::Failed(e) => eprintln!("{} failed: {}", pod, e),
            Outcome::Cancelled => println!("{} superseded", pod),
        }
    }

    let check = CheckDomain {
        client: client.clone(),
        pods,
    };
    let outcome = scheduler.run(Arc::new(check), Context::new()).await;
    println!("Domain check finished: {:?}", outcome.is_completed());

    scheduler.shutdown();
    Ok(())
}
