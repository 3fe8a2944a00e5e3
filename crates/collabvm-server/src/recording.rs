//! Chunked binary capture of a VM's message stream.
//!
//! One file per `file_duration` window, rolled over by a stop timer. A
//! keyframe timer periodically records the current file offset and
//! timestamp into the header's fixed-capacity index and asks the owner to
//! flush a fresh display snapshot, so playback can seek without replaying
//! the whole file prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use collabvm_proto::recording::{Keyframe, RecordingFileHeader};
use collabvm_proto::{RecordingSettings, RemoteInstruction, ServerMessage};

use crate::turn::ArmTimer;

/// Side effects requested by a controller mutation. The VM's owner performs
/// them outside the guard: timers are spawned, start/stop times are indexed
/// in the database, and `KeyframeFlush` writes a display snapshot.
#[derive(Debug, PartialEq, Eq)]
pub enum RecordingEvent {
    Started { path: String, at_ms: u64 },
    Stopped { path: String, at_ms: u64 },
    ArmStopTimer(ArmTimer),
    ArmKeyframeTimer(ArmTimer),
    /// Write instructions reproducing the current display, stamped with the
    /// keyframe's timestamp.
    KeyframeFlush,
}

struct OpenRecording {
    file: File,
    path: String,
    header: RecordingFileHeader,
    opened_at: Instant,
}

pub struct RecordingController {
    vm_id: u32,
    directory: PathBuf,
    settings: RecordingSettings,
    recording: Option<OpenRecording>,
    epoch: u64,
}

impl RecordingController {
    pub fn new(vm_id: u32, directory: PathBuf) -> Self {
        Self {
            vm_id,
            directory,
            settings: RecordingSettings::default(),
            recording: None,
            epoch: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn filename(&self) -> Option<&str> {
        self.recording.as_ref().map(|r| r.path.as_str())
    }

    pub fn is_current_epoch(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    fn file_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.settings.file_duration) * 60)
    }

    fn keyframe_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.settings.keyframe_interval))
    }

    fn keyframe_capacity(&self) -> usize {
        if self.settings.keyframe_interval == 0 {
            return 0;
        }
        (self.file_duration().as_secs() / self.keyframe_interval().as_secs()) as usize
    }

    /// Adopt new settings. If the new duration already elapsed for the open
    /// file the recording rolls over; otherwise both timers are re-armed
    /// against the new intervals.
    pub fn set_settings(&mut self, settings: RecordingSettings, now_ms: u64) -> Vec<RecordingEvent> {
        self.settings = settings;
        let Some(open) = &self.recording else {
            return Vec::new();
        };
        if self.settings.file_duration == 0 {
            return self.stop(now_ms);
        }
        let elapsed = open.opened_at.elapsed();
        let duration = self.file_duration();
        if elapsed >= duration {
            return self.start(now_ms);
        }

        self.epoch += 1;
        let mut events = vec![RecordingEvent::ArmStopTimer(ArmTimer {
            epoch: self.epoch,
            duration: duration - elapsed,
        })];
        if self.settings.keyframe_interval > 0 {
            events.push(RecordingEvent::ArmKeyframeTimer(ArmTimer {
                epoch: self.epoch,
                duration: self.keyframe_interval(),
            }));
        }
        events
    }

    /// Close any open file and begin a new one. The new file's start time is
    /// the previous file's stop time when rolling over.
    pub fn start(&mut self, now_ms: u64) -> Vec<RecordingEvent> {
        let mut events = self.stop(now_ms);
        if self.settings.file_duration == 0 {
            return events;
        }
        let start_ms = match events.last() {
            Some(RecordingEvent::Stopped { at_ms, .. }) => *at_ms,
            _ => now_ms,
        };

        if let Err(err) = fs::create_dir_all(&self.directory) {
            tracing::error!(vm_id = self.vm_id, error = %err, "failed to create recordings directory");
            return events;
        }
        let date_time = chrono::Local::now().format("%Y-%m-%d_%I-%M-%S_%p");
        let path = self
            .directory
            .join(format!("vm{}_{}.bin", self.vm_id, date_time));
        let path_str = path.to_string_lossy().into_owned();

        let file = match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(vm_id = self.vm_id, path = %path_str, error = %err,
                    "failed to create recording file");
                return events;
            }
        };

        let header = RecordingFileHeader::new(self.vm_id, start_ms, self.keyframe_capacity());
        let mut open = OpenRecording {
            file,
            path: path_str.clone(),
            header,
            opened_at: Instant::now(),
        };
        if let Err(err) = write_header(&mut open) {
            tracing::error!(vm_id = self.vm_id, error = %err, "failed to write recording header");
            return events;
        }
        self.recording = Some(open);

        self.epoch += 1;
        events.push(RecordingEvent::Started {
            path: path_str,
            at_ms: start_ms,
        });
        events.push(RecordingEvent::ArmStopTimer(ArmTimer {
            epoch: self.epoch,
            duration: self.file_duration(),
        }));
        if self.settings.keyframe_interval > 0 {
            events.push(RecordingEvent::ArmKeyframeTimer(ArmTimer {
                epoch: self.epoch,
                duration: self.keyframe_interval(),
            }));
        }
        // An initial snapshot at the head of the file.
        events.push(RecordingEvent::KeyframeFlush);
        events
    }

    /// Stamp the stop time, rewrite the header, and close the file.
    pub fn stop(&mut self, now_ms: u64) -> Vec<RecordingEvent> {
        self.epoch += 1;
        let Some(mut open) = self.recording.take() else {
            return Vec::new();
        };
        open.header.stop_time = now_ms;
        if let Err(err) = write_header(&mut open) {
            tracing::error!(vm_id = self.vm_id, error = %err, "failed to finalize recording header");
        }
        vec![RecordingEvent::Stopped {
            path: open.path,
            at_ms: now_ms,
        }]
    }

    /// Append one frame, honoring the capture filters for instruction
    /// messages. An IO failure ceases recording without touching the VM.
    pub fn write_message(&mut self, message: &ServerMessage) {
        if !self.is_message_recorded(message) {
            return;
        }
        let Some(open) = &mut self.recording else {
            return;
        };
        if let Err(err) = message.write_to(&mut open.file) {
            tracing::error!(vm_id = self.vm_id, path = %open.path, error = %err,
                "recording write failed, stopping capture");
            self.recording = None;
            self.epoch += 1;
        }
    }

    /// Keyframe timer fired: record (offset, timestamp), rewrite the header
    /// in place, and ask the owner for a snapshot. A full index forces a
    /// roll-over.
    pub fn keyframe(&mut self, epoch: u64, now_ms: u64) -> Vec<RecordingEvent> {
        if epoch != self.epoch {
            return Vec::new();
        }
        let Some(open) = &mut self.recording else {
            return Vec::new();
        };
        let offset = match open.file.stream_position() {
            Ok(offset) => offset,
            Err(err) => {
                tracing::error!(vm_id = self.vm_id, error = %err, "recording seek failed");
                return Vec::new();
            }
        };
        if !open.header.push_keyframe(Keyframe {
            file_offset: offset,
            timestamp: now_ms,
        }) {
            return self.start(now_ms);
        }
        if let Err(err) = write_header(open) {
            tracing::error!(vm_id = self.vm_id, error = %err, "recording header rewrite failed");
            self.recording = None;
            self.epoch += 1;
            return Vec::new();
        }
        vec![
            RecordingEvent::KeyframeFlush,
            RecordingEvent::ArmKeyframeTimer(ArmTimer {
                epoch: self.epoch,
                duration: self.keyframe_interval(),
            }),
        ]
    }

    /// Stop timer fired: roll over to a fresh file.
    pub fn stop_timer_fired(&mut self, epoch: u64, now_ms: u64) -> Vec<RecordingEvent> {
        if epoch != self.epoch {
            return Vec::new();
        }
        self.start(now_ms)
    }

    fn is_message_recorded(&self, message: &ServerMessage) -> bool {
        let ServerMessage::Instruction(instruction) = message else {
            return true;
        };
        let s = &self.settings;
        match instruction {
            RemoteInstruction::Sync(_) => s.capture_display || s.capture_input || s.capture_audio,
            RemoteInstruction::Audio(_) => s.capture_audio,
            RemoteInstruction::Mouse { .. } | RemoteInstruction::Key { .. } => s.capture_input,
            RemoteInstruction::Display { .. } => s.capture_display,
        }
    }
}

fn write_header(open: &mut OpenRecording) -> std::io::Result<()> {
    let bytes = open
        .header
        .to_bytes()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let position = open.file.stream_position()?;
    open.file.seek(SeekFrom::Start(0))?;
    open.file.write_all(&bytes)?;
    // The first write lands right after the header; later rewrites return
    // to where the frame stream left off.
    let resume = position.max(bytes.len() as u64);
    open.file.seek(SeekFrom::Start(resume))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn recording_settings() -> RecordingSettings {
        RecordingSettings {
            file_duration: 1,
            keyframe_interval: 15,
            capture_display: true,
            capture_input: true,
            capture_audio: true,
        }
    }

    fn sync_message(ts: u64) -> ServerMessage {
        ServerMessage::Instruction(RemoteInstruction::Sync(ts))
    }

    fn current_epoch(events: &[RecordingEvent]) -> u64 {
        events
            .iter()
            .find_map(|e| match e {
                RecordingEvent::ArmKeyframeTimer(t) => Some(t.epoch),
                _ => None,
            })
            .expect("keyframe timer armed")
    }

    #[test]
    fn start_produces_file_and_timers() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RecordingController::new(3, dir.path().to_path_buf());
        rec.set_settings(recording_settings(), 0);

        let events = rec.start(1_000);
        assert!(rec.is_recording());
        assert!(matches!(events[0], RecordingEvent::Started { at_ms: 1_000, .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, RecordingEvent::ArmStopTimer(t) if t.duration == Duration::from_secs(60))));
        assert!(events.iter().any(|e| matches!(e, RecordingEvent::KeyframeFlush)));

        let path = rec.filename().unwrap();
        assert!(path.contains("vm3_"));
        assert!(path.ends_with(".bin"));
    }

    #[test]
    fn duration_zero_disables_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RecordingController::new(1, dir.path().to_path_buf());
        let events = rec.start(0);
        assert!(events.is_empty());
        assert!(!rec.is_recording());
    }

    #[test]
    fn round_trip_with_keyframe_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RecordingController::new(7, dir.path().to_path_buf());
        rec.set_settings(recording_settings(), 0);
        let events = rec.start(10_000);
        let epoch = current_epoch(&events);
        let path = rec.filename().unwrap().to_string();

        // Simulated session: messages, then a keyframe followed by its
        // snapshot flush, more messages, a second keyframe.
        rec.write_message(&sync_message(10_500));
        rec.keyframe(epoch, 25_000);
        rec.write_message(&sync_message(25_000));
        rec.write_message(&sync_message(30_000));
        rec.keyframe(epoch, 40_000);
        rec.write_message(&sync_message(40_000));
        rec.stop(70_000);

        let mut file = File::open(&path).unwrap();
        let header = RecordingFileHeader::read_from(&mut file).unwrap();
        assert_eq!(header.vm_id, 7);
        assert_eq!(header.start_time, 10_000);
        assert_eq!(header.stop_time, 70_000);
        assert_eq!(header.keyframes.len(), 4); // capacity: 60s / 15s
        let keyframes = header.keyframes();
        assert_eq!(keyframes.len(), 2);
        assert!(keyframes[0].timestamp < keyframes[1].timestamp);

        // Each keyframe offset points at a message whose timestamp matches.
        for keyframe in keyframes {
            file.seek(SeekFrom::Start(keyframe.file_offset)).unwrap();
            let message = ServerMessage::read_from(&mut file).unwrap();
            assert_eq!(message, sync_message(keyframe.timestamp));
        }

        // Offsets never point past the end of the file.
        let file_len = fs::metadata(&path).unwrap().len();
        assert!(keyframes.iter().all(|k| k.file_offset <= file_len));
    }

    #[test]
    fn capture_filters_drop_filtered_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RecordingController::new(1, dir.path().to_path_buf());
        rec.set_settings(
            RecordingSettings {
                file_duration: 1,
                keyframe_interval: 0,
                capture_display: true,
                capture_input: false,
                capture_audio: false,
            },
            0,
        );
        rec.start(0);
        let path = rec.filename().unwrap().to_string();

        rec.write_message(&ServerMessage::Instruction(RemoteInstruction::Key {
            keysym: 0x41,
            pressed: true,
        }));
        rec.write_message(&ServerMessage::Instruction(RemoteInstruction::Audio(vec![1])));
        rec.write_message(&ServerMessage::Instruction(RemoteInstruction::Display {
            opcode: "png".to_string(),
            args: vec![],
        }));
        rec.stop(100);

        let mut file = File::open(&path).unwrap();
        RecordingFileHeader::read_from(&mut file).unwrap();
        let first = ServerMessage::read_from(&mut file).unwrap();
        assert!(matches!(
            first,
            ServerMessage::Instruction(RemoteInstruction::Display { .. })
        ));
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn full_keyframe_index_rolls_over() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RecordingController::new(1, dir.path().to_path_buf());
        rec.set_settings(
            RecordingSettings {
                file_duration: 1,
                keyframe_interval: 30, // capacity 2
                capture_display: true,
                capture_input: true,
                capture_audio: true,
            },
            0,
        );
        let events = rec.start(0);
        let epoch = current_epoch(&events);
        let first_path = rec.filename().unwrap().to_string();

        rec.keyframe(epoch, 30_000);
        let events = rec.keyframe(epoch, 60_000);
        // Second slot filled; the third tick forces a new file.
        let epoch = current_epoch(&events);
        let events = rec.keyframe(epoch, 90_000);
        assert!(events
            .iter()
            .any(|e| matches!(e, RecordingEvent::Stopped { at_ms: 90_000, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RecordingEvent::Started { at_ms: 90_000, .. })));
        assert_ne!(rec.filename().unwrap(), first_path);
    }

    #[test]
    fn stale_timer_epochs_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RecordingController::new(1, dir.path().to_path_buf());
        rec.set_settings(recording_settings(), 0);
        let events = rec.start(0);
        let epoch = current_epoch(&events);

        rec.stop(1_000);
        assert!(rec.keyframe(epoch, 2_000).is_empty());
        assert!(rec.stop_timer_fired(epoch, 2_000).is_empty());
    }
}
