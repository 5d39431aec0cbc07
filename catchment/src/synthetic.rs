//! Synthetic event-recommendation database.
//!
//! Users attend events over time and befriend each other. Both users and
//! events belong to latent interest clusters, and users mostly attend events
//! of their own cluster, so a model can learn the link structure from the
//! noisy cluster features and the attendance history.
//!
//! The `user-attendance` task asks which events a user attends within the
//! next `window_days` after a seed time. Training seed times step back from
//! the validation cutoff one window at a time; validation and test use a
//! single seed time each.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, TimeDelta};
use rand::prelude::*;
use rand::rngs::SmallRng;
use tracing::info;

use crate::common::{NodeType, SECONDS_PER_DAY, TIMELESS, Timestamp};
use crate::graph::{GraphBuilder, GraphError};
use crate::store::{Dataset, TaskTables};
use crate::task::{LinkExample, TaskMetadata, TaskType};

pub const DATASET_NAME: &str = "rel-event-synthetic";
pub const TASK_NAME: &str = "user-attendance";

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub num_users: usize,
    pub num_events: usize,
    pub num_clusters: usize,
    /// Attendances per user, on average.
    pub attendances_per_user: usize,
    pub friends_per_user: usize,
    /// Probability that an attendance (or friendship) stays inside the user's cluster.
    pub affinity: f64,
    pub start: NaiveDate,
    pub val_cutoff: NaiveDate,
    pub test_cutoff: NaiveDate,
    pub window_days: i64,
    pub eval_k: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_users: 2000,
            num_events: 500,
            num_clusters: 8,
            attendances_per_user: 12,
            friends_per_user: 4,
            affinity: 0.8,
            start: NaiveDate::from_ymd_opt(2012, 6, 1).unwrap_or_default(),
            val_cutoff: NaiveDate::from_ymd_opt(2012, 11, 21).unwrap_or_default(),
            test_cutoff: NaiveDate::from_ymd_opt(2012, 11, 29).unwrap_or_default(),
            window_days: 7,
            eval_k: 10,
            seed: 42,
        }
    }
}

fn epoch_seconds(date: NaiveDate) -> Timestamp {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp()
}

/// Noisy one-hot of `cluster` plus a trailing bias column.
fn cluster_features(cluster: usize, num_clusters: usize, rng: &mut SmallRng) -> Vec<f32> {
    let mut features: Vec<f32> = (0..num_clusters)
        .map(|c| f32::from(u8::from(c == cluster)) + rng.random_range(-0.3f32..0.3))
        .collect();
    features.push(1.0);
    features
}

/// Draw a member of `cluster` with probability `affinity`, else anyone.
fn pick_member(members: &[Vec<u32>], cluster: usize, total: usize, affinity: f64, rng: &mut SmallRng) -> u32 {
    let own = &members[cluster];
    if !own.is_empty() && rng.random_bool(affinity) {
        own[rng.random_range(0..own.len())]
    } else {
        rng.random_range(0..total as u32)
    }
}

pub fn generate(config: &SyntheticConfig) -> Result<Dataset, GraphError> {
    if config.num_users == 0 || config.num_events == 0 || config.num_clusters == 0 {
        return Err(GraphError::Mismatch(
            "synthetic dataset needs users, events and clusters".into(),
        ));
    }
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let k = config.num_clusters;
    let start = epoch_seconds(config.start);
    let val_time = epoch_seconds(config.val_cutoff);
    let test_time = epoch_seconds(config.test_cutoff);
    let window = TimeDelta::days(config.window_days).num_seconds();
    let end = test_time + window;

    // Entities.
    let user_cluster: Vec<usize> = (0..config.num_users).map(|_| rng.random_range(0..k)).collect();
    let event_cluster: Vec<usize> = (0..config.num_events).map(|_| rng.random_range(0..k)).collect();
    let mut users_by_cluster = vec![Vec::new(); k];
    for (u, &c) in user_cluster.iter().enumerate() {
        users_by_cluster[c].push(u as u32);
    }
    let mut events_by_cluster = vec![Vec::new(); k];
    for (e, &c) in event_cluster.iter().enumerate() {
        events_by_cluster[c].push(e as u32);
    }
    let event_created: Vec<Timestamp> = (0..config.num_events)
        .map(|_| rng.random_range(start..end))
        .collect();

    let user_features: Vec<f32> = user_cluster
        .iter()
        .flat_map(|&c| cluster_features(c, k, &mut rng))
        .collect();
    let event_features: Vec<f32> = event_cluster
        .iter()
        .flat_map(|&c| cluster_features(c, k, &mut rng))
        .collect();

    // Attendances happen after the event is created; one per (user, event).
    let mut seen = BTreeSet::new();
    let mut attendances = Vec::new();
    for (u, &c) in user_cluster.iter().enumerate() {
        for _ in 0..config.attendances_per_user {
            let e = pick_member(&events_by_cluster, c, config.num_events, config.affinity, &mut rng);
            if seen.insert((u as u32, e)) {
                let t = rng.random_range(event_created[e as usize]..=end);
                attendances.push((u as u32, e, t));
            }
        }
    }

    let mut friendships = Vec::new();
    for (u, &c) in user_cluster.iter().enumerate() {
        for _ in 0..config.friends_per_user {
            let v = pick_member(&users_by_cluster, c, config.num_users, config.affinity, &mut rng);
            if v != u as u32 {
                friendships.push((u as u32, v, TIMELESS));
            }
        }
    }

    let mut builder = GraphBuilder::new();
    let users = builder.add_node_type("users", k + 1, user_features, None)?;
    let events = builder.add_node_type("events", k + 1, event_features, Some(event_created))?;
    builder.add_relation(users, "attends", events, &attendances)?;
    builder.add_relation(users, "befriends", users, &friendships)?;
    let graph = builder.build()?;

    let task = attendance_task(config, users, events, &attendances, start, val_time, test_time, window);
    info!(
        "Synthetic dataset: {} users, {} events, {} attendances, {} friendships; task {} train/val/test = {}/{}/{}",
        config.num_users,
        config.num_events,
        attendances.len(),
        friendships.len(),
        TASK_NAME,
        task.train.len(),
        task.val.len(),
        task.test.len()
    );

    Ok(Dataset {
        name: DATASET_NAME.to_string(),
        graph: Arc::new(graph),
        tasks: vec![task],
    })
}

/// Attendances in `(seed_time, seed_time + window]`, as examples seeded at `seed_time`.
fn window_examples(attendances: &[(u32, u32, Timestamp)], seed_time: Timestamp, window: Timestamp) -> Vec<LinkExample> {
    attendances
        .iter()
        .filter(|&&(_, _, t)| t > seed_time && t <= seed_time + window)
        .map(|&(src, dst, _)| LinkExample {
            src,
            dst,
            time: seed_time,
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn attendance_task(
    config: &SyntheticConfig,
    users: NodeType,
    events: NodeType,
    attendances: &[(u32, u32, Timestamp)],
    start: Timestamp,
    val_time: Timestamp,
    test_time: Timestamp,
    window: Timestamp,
) -> TaskTables {
    let mut train = Vec::new();
    let mut seed_time = val_time - window;
    while seed_time >= start {
        train.extend(window_examples(attendances, seed_time, window));
        seed_time -= window;
    }
    // Oldest windows first.
    train.sort_by_key(|ex| (ex.time, ex.src, ex.dst));

    TaskTables {
        meta: TaskMetadata {
            name: TASK_NAME.to_string(),
            task_type: TaskType::LinkPrediction,
            src_entity: users,
            dst_entity: events,
            eval_k: config.eval_k,
            val_seed_time: val_time,
            test_seed_time: test_time,
        },
        train,
        val: window_examples(attendances, val_time, window),
        test: window_examples(attendances, test_time, window),
    }
}

/// Days between two timestamps, for log lines.
pub fn days_between(from: Timestamp, to: Timestamp) -> f64 {
    (to - from) as f64 / SECONDS_PER_DAY
}
