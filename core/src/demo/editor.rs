//! Demo editing

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};

use super::DemoError;
use super::player::{DemoListener, DemoPlayer};
use super::recorder::{DemoRecorder, MessageFilter, RecordingMap, StopMode};
use crate::config::DemoConfig;
use crate::snapshot::{Snapshot, SnapshotDelta};

/// Re-records the ticks inside a range, and notes when playback passed it.
struct SliceListener {
    recorder: DemoRecorder<BufWriter<File>>,
    from: Option<i32>,
    to: Option<i32>,
    done: bool,
    error: Option<DemoError>,
}

impl SliceListener {
    fn wants(&mut self, tick: i32) -> bool {
        if self.to.is_some_and(|to| tick > to) {
            self.done = true;
            return false;
        }
        self.error.is_none() && self.from.is_none_or(|from| tick >= from)
    }
}

impl DemoListener for SliceListener {
    fn on_snapshot(&mut self, tick: i32, snapshot: &Snapshot) {
        if self.wants(tick)
            && let Err(e) = self.recorder.record_snapshot(tick, snapshot)
        {
            self.error = Some(e);
        }
    }

    fn on_message(&mut self, tick: i32, data: &[u8]) {
        if self.wants(tick)
            && let Err(e) = self.recorder.record_message(data)
        {
            self.error = Some(e);
        }
    }
}

/// Cuts demos.
#[derive(Debug, Clone, Default)]
pub struct DemoEditor {
    delta: SnapshotDelta,
    config: DemoConfig,
}

impl DemoEditor {
    pub fn new(delta: SnapshotDelta, config: DemoConfig) -> Self {
        Self { delta, config }
    }

    /// Write the ticks `start_tick..=end_tick` of `src` to a new demo at `dst`.
    ///
    /// `None` leaves that end of the range open. Messages go through `filter`
    /// before being re-recorded.
    pub fn slice(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        start_tick: Option<i32>,
        end_tick: Option<i32>,
        filter: Option<MessageFilter>,
    ) -> anyhow::Result<()> {
        let (src, dst) = (src.as_ref(), dst.as_ref());

        let mut recorder = DemoRecorder::new(self.delta.clone(), self.config.clone());
        recorder.set_filter(filter);
        let listener = SliceListener {
            recorder,
            from: start_tick,
            to: end_tick,
            done: false,
            error: None,
        };
        let mut player: DemoPlayer<SliceListener> =
            DemoPlayer::new(listener, self.delta.clone(), self.config.clone());
        player
            .load_file(src)
            .with_context(|| format!("failed to load demo {}", src.display()))?;

        let map_data = player
            .map_data()
            .context("failed to read map data")?
            .unwrap_or_default();
        let map_info = player.map_info().clone();
        let sha256 = match map_info.sha256 {
            Some(sha256) => sha256,
            None => {
                let mut sha256 = [0u8; 32];
                sha256.copy_from_slice(&Sha256::digest(&map_data));
                sha256
            }
        };
        let map = RecordingMap {
            name: &map_info.name,
            crc: map_info.crc,
            sha256,
            data: &map_data,
        };
        player
            .listener_mut()
            .recorder
            .start_file(dst, &map)
            .with_context(|| format!("failed to start recording {}", dst.display()))?;

        player.play();
        while player.is_playing() && !player.listener().done {
            player.update(Duration::ZERO, false);
            if player.info().paused {
                break;
            }
        }
        player.stop();

        let mut listener = player.into_listener();
        if let Some(error) = listener.error.take() {
            if let Err(e) = listener.recorder.stop(StopMode::Discard) {
                tracing::warn!(error = %e, "failed to discard slice");
            }
            return Err(error).context("failed to record slice");
        }
        listener
            .recorder
            .stop(StopMode::Keep)
            .context("failed to finish slice")?;

        tracing::info!(
            src = %src.display(),
            dst = %dst.display(),
            ?start_tick,
            ?end_tick,
            "sliced demo"
        );
        Ok(())
    }
}
