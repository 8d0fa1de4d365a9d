use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    job_topic, ConnectionLifecycleManager, JobManagementClient, JobQueueEvent, JobQueueMonitor,
    WebSocketChannelFactory,
};
use shared::domain::{Difficulty, UserId};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    /// Request a generation with this theme before tailing the job stream.
    #[arg(long)]
    theme: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let lifecycle = ConnectionLifecycleManager::new(Arc::new(WebSocketChannelFactory::new(
        args.server_url.clone(),
    )));

    let monitor = JobQueueMonitor::new(lifecycle.attach(&job_topic(UserId(args.user_id))));
    monitor.connect().await?;
    println!("Watching job stream for user {}", args.user_id);

    if let Some(theme) = args.theme {
        let management = JobManagementClient::new(lifecycle.attach("session_list"));
        management.connect().await?;
        management
            .generate_mystery(Some(theme), Difficulty::default())
            .await?;
        println!("Generation requested; the outcome arrives on the job stream.");
    }

    let mut events = monitor.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(JobQueueEvent::Replaced) => {
                    let jobs = monitor.jobs();
                    println!(
                        "jobs: {} running / {} completed",
                        jobs.running.len(),
                        jobs.completed.len()
                    );
                }
                Ok(JobQueueEvent::Updated { job_id, transition }) => {
                    println!("job {}: {transition:?}", job_id.0);
                }
                Ok(JobQueueEvent::ConnectionChanged(connected)) => {
                    println!("connection: {}", if connected { "up" } else { "down" });
                }
                Ok(JobQueueEvent::Error(message)) => {
                    eprintln!("error: {message}");
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
