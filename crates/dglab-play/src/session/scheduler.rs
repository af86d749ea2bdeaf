//! Waveform replay against the App's bounded pulse queue.
//!
//! The App plays at most [`QUEUE_CAPACITY`] of queued pulse data and accepts
//! at most [`MAX_PULSES_PER_MESSAGE`] operations per message. The scheduler
//! front-loads the queue once, then tops it up by exactly one post per post
//! duration for as long as it runs.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info};

use dglab_core::pulse::{MAX_PULSES_PER_MESSAGE, SEGMENT_UNIT};
use dglab_core::{Channel, DeviceLink, DgLabError, DgLabResult, PulseOperation};

use crate::config::PulseSettings;

/// Total playback time the App's pulse queue holds.
pub const QUEUE_CAPACITY: Duration = Duration::from_secs(50);

/// How a waveform is packed into posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPlan {
    /// Playback time of one repetition of the waveform.
    pub unit_duration: Duration,
    /// Repetitions packed into each post.
    pub replay_count: usize,
    /// Playback time of one post.
    pub post_duration: Duration,
    /// Posts submitted up front to fill the queue.
    pub initial_posts: usize,
}

impl ReplayPlan {
    /// Fit as many whole repetitions of a `segment_count` waveform into
    /// `post_budget` as possible, and as many such posts into the queue.
    pub fn compute(segment_count: usize, post_budget: Duration) -> DgLabResult<Self> {
        if segment_count == 0 {
            return Err(DgLabError::Config("waveform has no segments".into()));
        }
        let unit_ms = segment_count as u128 * SEGMENT_UNIT.as_millis();
        let replay_count = (post_budget.as_millis() / unit_ms) as usize;
        if replay_count == 0 {
            return Err(DgLabError::Config(format!(
                "waveform of {segment_count} segments does not fit in pulse.duration_per_post ({:.1}s)",
                post_budget.as_secs_f64()
            )));
        }
        let post_ms = replay_count as u128 * unit_ms;
        let initial_posts = (QUEUE_CAPACITY.as_millis() / post_ms) as usize;
        Ok(Self {
            unit_duration: Duration::from_millis(unit_ms as u64),
            replay_count,
            post_duration: Duration::from_millis(post_ms as u64),
            initial_posts,
        })
    }

    /// Queued playback time right after the fill phase.
    pub fn filled_duration(&self) -> Duration {
        self.post_duration * self.initial_posts as u32
    }
}

/// One running replay of a waveform on a set of channels.
pub struct WaveformScheduler {
    tenant_id: String,
    link: Arc<dyn DeviceLink>,
    segments: Vec<PulseOperation>,
    channels: Vec<Channel>,
    settings: PulseSettings,
}

impl WaveformScheduler {
    pub fn new(
        tenant_id: String,
        link: Arc<dyn DeviceLink>,
        segments: Vec<PulseOperation>,
        channels: Vec<Channel>,
        settings: PulseSettings,
    ) -> Self {
        Self {
            tenant_id,
            link,
            segments,
            channels,
            settings,
        }
    }

    /// Replay until cancelled. Failures end the replay and are logged here.
    pub async fn run(self) {
        let result = self.drive().await;
        match result {
            Ok(never) => match never {},
            Err(DgLabError::PulseTooLong { count, max }) => {
                error!(
                    tenant = %self.tenant_id,
                    count,
                    max,
                    "pulse post exceeds the per-message limit; lower pulse.duration_per_post"
                );
            }
            Err(e) => {
                error!(tenant = %self.tenant_id, error = %e, "waveform replay stopped");
            }
        }
    }

    async fn drive(&self) -> DgLabResult<Infallible> {
        for &channel in &self.channels {
            self.link.clear_queue(channel).await?;
        }
        sleep(self.settings.sleep_after_clear).await;

        let plan = ReplayPlan::compute(self.segments.len(), self.settings.duration_per_post)?;
        let post = self.post_segments(&plan);
        if post.len() > MAX_PULSES_PER_MESSAGE {
            return Err(DgLabError::PulseTooLong {
                count: post.len(),
                max: MAX_PULSES_PER_MESSAGE,
            });
        }
        info!(
            tenant = %self.tenant_id,
            replay_count = plan.replay_count,
            post_secs = plan.post_duration.as_secs_f64(),
            initial_posts = plan.initial_posts,
            "waveform replay started"
        );

        for _ in 0..plan.initial_posts {
            self.submit(&post).await?;
            sleep(self.settings.post_interval).await;
        }
        sleep(abs_diff(plan.post_duration, self.settings.post_interval)).await;

        loop {
            self.submit(&post).await?;
            sleep(plan.post_duration).await;
        }
    }

    fn post_segments(&self, plan: &ReplayPlan) -> Vec<PulseOperation> {
        let mut post = Vec::with_capacity(self.segments.len() * plan.replay_count);
        for _ in 0..plan.replay_count {
            post.extend_from_slice(&self.segments);
        }
        post
    }

    async fn submit(&self, post: &[PulseOperation]) -> DgLabResult<()> {
        for &channel in &self.channels {
            self.link.add_segments(channel, post).await?;
        }
        debug!(tenant = %self.tenant_id, len = post.len(), "pulse post submitted");
        Ok(())
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockCommand, MockLink};

    fn pulse_settings(post: Duration) -> PulseSettings {
        PulseSettings {
            duration_per_post: post,
            post_interval: Duration::from_secs(1),
            sleep_after_clear: Duration::from_millis(500),
            ..PulseSettings::default()
        }
    }

    fn waveform(len: usize) -> Vec<PulseOperation> {
        vec![PulseOperation::new([10; 4], [50; 4]); len]
    }

    #[test]
    fn eleven_segment_plan() {
        let plan = ReplayPlan::compute(11, Duration::from_secs(8)).unwrap();
        assert_eq!(plan.unit_duration, Duration::from_millis(1100));
        assert_eq!(plan.replay_count, 7);
        assert_eq!(plan.post_duration, Duration::from_millis(7700));
        assert_eq!(plan.initial_posts, 6);
    }

    #[test]
    fn fill_never_exceeds_queue() {
        for segment_count in 1..=120 {
            for budget_ms in (100..=20_000).step_by(100) {
                let budget = Duration::from_millis(budget_ms);
                let Ok(plan) = ReplayPlan::compute(segment_count, budget) else {
                    assert!(segment_count as u64 * 100 > budget_ms);
                    continue;
                };
                assert!(plan.post_duration <= budget);
                assert!(plan.filled_duration() <= QUEUE_CAPACITY);
            }
        }
    }

    #[test]
    fn empty_or_oversized_waveform_rejected() {
        assert!(matches!(
            ReplayPlan::compute(0, Duration::from_secs(10)),
            Err(DgLabError::Config(_))
        ));
        assert!(matches!(
            ReplayPlan::compute(200, Duration::from_secs(10)),
            Err(DgLabError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fill_then_steady_timing() {
        let link = MockLink::bound("t1", "app");
        let scheduler = WaveformScheduler::new(
            "u1".into(),
            link.clone(),
            waveform(11),
            vec![Channel::A],
            pulse_settings(Duration::from_secs(8)),
        );
        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(21_000)).await;
        task.abort();

        let sent = link.sent();
        assert_eq!(sent[0].command, MockCommand::Clear(Channel::A));
        let posts: Vec<u64> = sent
            .iter()
            .filter(|s| matches!(s.command, MockCommand::Pulse { len: 77, .. }))
            .map(|s| s.at.as_millis() as u64)
            .collect();
        assert_eq!(
            posts,
            vec![500, 1500, 2500, 3500, 4500, 5500, 13_200, 20_900]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn every_channel_gets_each_post() {
        let link = MockLink::bound("t1", "app");
        let scheduler = WaveformScheduler::new(
            "u1".into(),
            link.clone(),
            waveform(10),
            Channel::BOTH.to_vec(),
            pulse_settings(Duration::from_secs(10)),
        );
        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(600)).await;
        task.abort();

        let commands: Vec<MockCommand> = link.sent().into_iter().map(|s| s.command).collect();
        assert_eq!(
            commands,
            vec![
                MockCommand::Clear(Channel::A),
                MockCommand::Clear(Channel::B),
                MockCommand::Pulse {
                    channel: Channel::A,
                    len: 100
                },
                MockCommand::Pulse {
                    channel: Channel::B,
                    len: 100
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_post_ends_replay() {
        let link = MockLink::bound("t1", "app");
        let scheduler = WaveformScheduler::new(
            "u1".into(),
            link.clone(),
            waveform(10),
            vec![Channel::A],
            pulse_settings(Duration::from_secs(20)),
        );
        // Finishes on its own instead of looping.
        scheduler.run().await;
        assert!(link
            .sent()
            .iter()
            .all(|s| !matches!(s.command, MockCommand::Pulse { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unbound_link_ends_replay() {
        let link = MockLink::new("t1");
        let scheduler = WaveformScheduler::new(
            "u1".into(),
            link.clone(),
            waveform(10),
            vec![Channel::A],
            pulse_settings(Duration::from_secs(10)),
        );
        scheduler.run().await;
        assert!(link.sent().is_empty());
    }
}
