//! Reading recordings back: keyframe-indexed seeking and thumbnail
//! rendering for preview requests.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use collabvm_proto::recording::RecordingFileHeader;
use collabvm_proto::{RemoteInstruction, ServerMessage};

use crate::remote::CompositorFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFrame {
    pub timestamp: u64,
    pub png: Vec<u8>,
}

/// One open recording file with a virtual clock driven by sync
/// instructions.
pub struct RecordingReader {
    file: File,
    header: RecordingFileHeader,
    clock: u64,
}

impl RecordingReader {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        let header = RecordingFileHeader::read_from(&mut file)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let clock = header.start_time;
        Ok(Self {
            file,
            header,
            clock,
        })
    }

    pub fn header(&self) -> &RecordingFileHeader {
        &self.header
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn data_start(&self) -> u64 {
        RecordingFileHeader::encoded_len(self.header.keyframes.len())
    }

    /// Position the reader at the latest keyframe at or before `timestamp`,
    /// falling back to the head of the frame stream. The keyframe index is
    /// sorted by timestamp, so a binary search finds the seek target.
    pub fn seek_to_timestamp(&mut self, timestamp: u64) -> std::io::Result<()> {
        let keyframes = self.header.keyframes();
        let idx = keyframes.partition_point(|k| k.timestamp <= timestamp);
        if idx == 0 {
            self.file.seek(SeekFrom::Start(self.data_start()))?;
            self.clock = self.header.start_time;
        } else {
            let keyframe = keyframes[idx - 1];
            self.file.seek(SeekFrom::Start(keyframe.file_offset))?;
            self.clock = keyframe.timestamp;
        }
        Ok(())
    }

    /// Whether rendering `target` requires a seek: either the target lies
    /// behind the clock, or a later keyframe sits between the clock and the
    /// target and skipping ahead to it avoids replaying the gap.
    pub fn needs_seek(&self, target: u64) -> bool {
        if target < self.clock {
            return true;
        }
        let keyframes = self.header.keyframes();
        let idx = keyframes.partition_point(|k| k.timestamp <= target);
        idx > 0 && keyframes[idx - 1].timestamp > self.clock
    }

    /// Next instruction in the stream, advancing the clock on sync points.
    /// `None` at end of file or on a truncated frame.
    pub fn next_instruction(&mut self) -> Option<RemoteInstruction> {
        loop {
            match ServerMessage::read_from(&mut self.file) {
                Ok(ServerMessage::Instruction(instruction)) => {
                    if let RemoteInstruction::Sync(ts) = instruction {
                        self.clock = ts;
                    }
                    return Some(instruction);
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Where playback should continue once this file is exhausted. Always
    /// past the file's start so the walk over covering files makes progress.
    pub fn next_file_timestamp(&self) -> u64 {
        (self.header.start_time + 1).max(self.header.stop_time)
    }
}

/// Render preview thumbnails from one file.
///
/// With `time_interval > 0`, a thumbnail is produced per interval step:
/// each seeks to the keyframe at or before the target and replays forward
/// until the virtual clock passes it. With `time_interval == 0`, one
/// thumbnail is produced per keyframe boundary, each from a fresh
/// compositor. Returns the timestamp the caller should continue from.
#[allow(clippy::too_many_arguments)]
pub fn render_file_previews(
    path: &Path,
    start_target: u64,
    stop_time: u64,
    time_interval: u64,
    width: u32,
    height: u32,
    compositors: &dyn CompositorFactory,
    emit: &mut dyn FnMut(PreviewFrame),
) -> std::io::Result<u64> {
    let mut reader = RecordingReader::open(path)?;
    let mut target = start_target.max(reader.header().start_time);

    if time_interval > 0 {
        reader.seek_to_timestamp(target)?;
        let mut compositor = compositors.create();
        while target < stop_time {
            let file_stop = reader.header().stop_time;
            if file_stop > 0 && target > file_stop {
                break;
            }
            let initial = reader.clock();
            let mut applied = false;
            while let Some(instruction) = reader.next_instruction() {
                compositor.apply(&instruction);
                applied = true;
                if reader.clock() >= target && reader.clock() != initial {
                    break;
                }
            }
            if !applied {
                break;
            }
            if let Some(png) = compositor.render_png(width, height) {
                emit(PreviewFrame {
                    timestamp: reader.clock(),
                    png,
                });
            }
            target = reader.clock() + time_interval;
            // Only seek when it moves us: jumping to a later keyframe picks
            // up its snapshot, so the compositor starts fresh there. Forward
            // replay without a seek keeps compositing the same display.
            if reader.needs_seek(target) {
                reader.seek_to_timestamp(target)?;
                compositor = compositors.create();
            }
        }
    } else {
        let boundaries: Vec<u64> = {
            let keyframes = reader.header().keyframes();
            std::iter::once(target)
                .chain(keyframes.iter().map(|k| k.timestamp).filter(|t| *t > target))
                .collect()
        };
        for boundary in boundaries {
            if boundary >= stop_time {
                break;
            }
            reader.seek_to_timestamp(boundary)?;
            let mut compositor = compositors.create();
            let initial = reader.clock();
            let mut applied = false;
            while let Some(instruction) = reader.next_instruction() {
                compositor.apply(&instruction);
                applied = true;
                if reader.clock() >= boundary && reader.clock() != initial {
                    break;
                }
            }
            if !applied {
                break;
            }
            if let Some(png) = compositor.render_png(width, height) {
                emit(PreviewFrame {
                    timestamp: reader.clock(),
                    png,
                });
            }
        }
    }

    Ok(reader.next_file_timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingController, RecordingEvent};
    use crate::remote::Compositor;
    use collabvm_proto::RecordingSettings;

    /// Renders the virtual clock into the "PNG" bytes so tests can assert
    /// which frames were composited.
    struct ClockCompositor {
        clock: u64,
    }

    impl Compositor for ClockCompositor {
        fn apply(&mut self, instruction: &RemoteInstruction) {
            if let RemoteInstruction::Sync(ts) = instruction {
                self.clock = *ts;
            }
        }
        fn render_png(&self, _w: u32, _h: u32) -> Option<Vec<u8>> {
            Some(self.clock.to_le_bytes().to_vec())
        }
    }

    struct ClockCompositorFactory;

    impl CompositorFactory for ClockCompositorFactory {
        fn create(&self) -> Box<dyn Compositor> {
            Box::new(ClockCompositor { clock: 0 })
        }
    }

    fn sync(ts: u64) -> ServerMessage {
        ServerMessage::Instruction(RemoteInstruction::Sync(ts))
    }

    /// A one-minute recording with keyframes every 15 "seconds" of virtual
    /// time and one sync frame per second of interest.
    fn write_fixture(dir: &Path) -> String {
        let mut rec = RecordingController::new(1, dir.to_path_buf());
        let events = rec.set_settings(
            RecordingSettings {
                file_duration: 1,
                keyframe_interval: 15,
                capture_display: true,
                capture_input: true,
                capture_audio: true,
            },
            0,
        );
        assert!(events.is_empty());

        let events = rec.start(0);
        let epoch = events
            .iter()
            .find_map(|e| match e {
                RecordingEvent::ArmKeyframeTimer(t) => Some(t.epoch),
                _ => None,
            })
            .unwrap();
        let path = rec.filename().unwrap().to_string();

        rec.write_message(&sync(1_000));
        rec.write_message(&sync(5_000));
        rec.keyframe(epoch, 15_000);
        rec.write_message(&sync(15_000));
        rec.write_message(&sync(20_000));
        rec.keyframe(epoch, 30_000);
        rec.write_message(&sync(30_000));
        rec.write_message(&sync(35_000));
        rec.stop(60_000);
        path
    }

    #[test]
    fn reader_seeks_to_covering_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path());

        let mut reader = RecordingReader::open(Path::new(&path)).unwrap();
        reader.seek_to_timestamp(22_000).unwrap();
        assert_eq!(reader.clock(), 15_000);
        // The first frame after that keyframe is its snapshot sync.
        assert_eq!(
            reader.next_instruction(),
            Some(RemoteInstruction::Sync(15_000))
        );

        // Before any keyframe: the head of the stream.
        reader.seek_to_timestamp(500).unwrap();
        assert_eq!(reader.clock(), 0);
        assert_eq!(
            reader.next_instruction(),
            Some(RemoteInstruction::Sync(1_000))
        );
    }

    #[test]
    fn interval_previews_advance_by_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path());

        let mut frames = Vec::new();
        let next = render_file_previews(
            Path::new(&path),
            0,
            60_000,
            10_000,
            320,
            240,
            &ClockCompositorFactory,
            &mut |f| frames.push(f),
        )
        .unwrap();

        assert!(!frames.is_empty());
        // Thumbnails move strictly forward in time.
        assert!(frames.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        // The rendered clock matches the reported timestamp.
        for frame in &frames {
            assert_eq!(frame.png, frame.timestamp.to_le_bytes().to_vec());
        }
        assert_eq!(next, 60_000);
    }

    #[test]
    fn keyframe_previews_hit_each_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path());

        let mut frames = Vec::new();
        render_file_previews(
            Path::new(&path),
            0,
            60_000,
            0,
            320,
            240,
            &ClockCompositorFactory,
            &mut |f| frames.push(f),
        )
        .unwrap();

        // One from the file head plus one per keyframe.
        assert_eq!(frames.len(), 3);
        assert!(frames[1].timestamp >= 15_000);
        assert!(frames[2].timestamp >= 30_000);
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, b"not a recording").unwrap();
        assert!(RecordingReader::open(&path).is_err());
    }
}
