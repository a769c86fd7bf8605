//! # Serialized log format
//!
//! Binary, little-endian, length-prefixed. The stream is a picture header
//! followed by each buffer's header and its ordered event records, closed by
//! a CRC-32 of everything after the magic. Every event record carries its
//! own byte length so a reader can skip records it does not understand -
//! unknown or malformed records are skipped with a diagnostic and loading
//! continues (newer writers may append fields to known records; trailing
//! bytes are ignored for the same reason).
//!
//! Geometry is stored in picture pixels and rescaled by a single global
//! bitmap-scale factor on load. Colors are stored as 0-255 channels.

use az::CheckedAs;
use std::io::{Error as IOError, Read, Result as IOResult, Write};

use crate::buffer::Buffer;
use crate::checkpoint::CheckpointPolicy;
use crate::color::Color;
use crate::event::{
    BrushStroke, BufferCreate, BufferMerge, BufferMove, BufferRemove, Event, EventHide, Gradient,
    ImageImport, Payload, StrokePoint,
};
use crate::id::{BufferId, SessionId};
use crate::picture::Picture;
use crate::raster::{CapacityError, ImageData, Surface};

const MAGIC: &[u8; 4] = b"SBLE";
const FORMAT_VERSION: u16 = 1;

// Everything after the magic is covered by the trailing CRC-32.
static STREAM_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

// Hostile-input caps. Real pictures sit far below all of these.
const MAX_BUFFERS: u32 = 4096;
const MAX_EVENTS: u32 = 1 << 20;
const MAX_RECORD: u32 = 1 << 26;
const MAX_IMAGE_DIM: u32 = 1 << 14;

const TAG_BRUSH: u8 = 1;
const TAG_SCATTER: u8 = 2;
const TAG_GRADIENT: u8 = 3;
const TAG_IMPORT: u8 = 4;
const TAG_CREATE: u8 = 5;
const TAG_REMOVE: u8 = 6;
const TAG_MERGE: u8 = 7;
const TAG_MOVE: u8 = 8;
const TAG_HIDE: u8 = 9;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct EventFlags: u8 {
        const UNDONE = 1;
    }
}
bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct BufferFlags: u8 {
        const HAS_ALPHA = 1;
        const UNDOABLE = 2;
        const VISIBLE = 4;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a picture stream")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("stream checksum mismatch")]
    ChecksumMismatch,
    #[error("malformed stream: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
}

/// Knobs for [`read_picture`].
#[derive(Copy, Clone, Debug)]
pub struct ReadOptions {
    /// Global bitmap-scale factor applied to picture dimensions and event
    /// geometry. Imported image pixels are not resampled, only their
    /// placement scales.
    pub scale: f32,
    /// The session to resume authoring as; its next sequence number is
    /// seeded from the loaded history.
    pub session: SessionId,
    pub policy: CheckpointPolicy,
}
impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            session: SessionId(0),
            policy: CheckpointPolicy::default(),
        }
    }
}

struct CrcWriter<W: Write> {
    writer: W,
    digest: crc::Digest<'static, u32>,
}
impl<W: Write> CrcWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            digest: STREAM_CRC.digest(),
        }
    }
    fn finish(self) -> (W, u32) {
        (self.writer, self.digest.finalize())
    }
}
impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        let written = self.writer.write(buf)?;
        self.digest.update(&buf[..written]);
        Ok(written)
    }
    fn flush(&mut self) -> IOResult<()> {
        self.writer.flush()
    }
}

struct CrcReader<R: Read> {
    reader: R,
    digest: crc::Digest<'static, u32>,
}
impl<R: Read> CrcReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            digest: STREAM_CRC.digest(),
        }
    }
    fn finish(self) -> (R, u32) {
        (self.reader, self.digest.finalize())
    }
}
impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> IOResult<usize> {
        let count = self.reader.read(buf)?;
        self.digest.update(&buf[..count]);
        Ok(count)
    }
}

fn write_u16<W: Write>(w: &mut W, value: u16) -> IOResult<()> {
    w.write_all(&value.to_le_bytes())
}
fn write_u32<W: Write>(w: &mut W, value: u32) -> IOResult<()> {
    w.write_all(&value.to_le_bytes())
}
fn read_u8<R: Read>(r: &mut R) -> IOResult<u8> {
    let mut bytes = [0u8; 1];
    r.read_exact(&mut bytes)?;
    Ok(bytes[0])
}
fn read_u16<R: Read>(r: &mut R) -> IOResult<u16> {
    let mut bytes = [0u8; 2];
    r.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}
fn read_u32<R: Read>(r: &mut R) -> IOResult<u32> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Serialize the picture's full log. Deterministic: serializing twice
/// yields identical bytes.
pub fn write_picture<S: Surface, W: Write>(picture: &Picture<S>, mut writer: W) -> IOResult<()> {
    writer.write_all(MAGIC)?;
    let mut w = CrcWriter::new(writer);
    write_u16(&mut w, FORMAT_VERSION)?;
    write_u32(&mut w, picture.width())?;
    write_u32(&mut w, picture.height())?;
    let count: u32 = picture
        .buffers()
        .len()
        .checked_as()
        .ok_or_else(|| IOError::other(anyhow::anyhow!("too many buffers to serialize")))?;
    write_u32(&mut w, count)?;
    let mut scratch = Vec::new();
    for buffer in picture.buffers() {
        write_buffer(&mut w, buffer, &mut scratch)?;
    }
    let (mut writer, checksum) = w.finish();
    writer.write_all(&checksum.to_le_bytes())
}

fn write_buffer<S: Surface, W: Write>(
    w: &mut W,
    buffer: &Buffer<S>,
    scratch: &mut Vec<u8>,
) -> IOResult<()> {
    write_u32(w, buffer.id().0)?;
    w.write_all(&buffer.clear_color().to_rgba8())?;
    let mut flags = BufferFlags::empty();
    flags.set(BufferFlags::HAS_ALPHA, buffer.has_alpha());
    flags.set(BufferFlags::UNDOABLE, buffer.undoable());
    flags.set(BufferFlags::VISIBLE, buffer.visible());
    w.write_all(&[flags.bits()])?;
    w.write_all(&[(buffer.opacity().clamp(0.0, 1.0) * 255.0).round() as u8])?;
    // Insertion point travels as a distance from the log end so it stays
    // meaningful if a reader drops records.
    let offset = buffer.events().len() - buffer.insertion_point();
    write_u32(
        w,
        offset
            .checked_as()
            .ok_or_else(|| IOError::other(anyhow::anyhow!("insertion offset out of range")))?,
    )?;
    let count: u32 = buffer
        .events()
        .len()
        .checked_as()
        .ok_or_else(|| IOError::other(anyhow::anyhow!("too many events to serialize")))?;
    write_u32(w, count)?;
    for event in buffer.events() {
        scratch.clear();
        encode_event(event, scratch);
        let len: u32 = scratch
            .len()
            .checked_as()
            .filter(|len| *len <= MAX_RECORD)
            .ok_or_else(|| IOError::other(anyhow::anyhow!("event record exceeds size cap")))?;
        write_u32(w, len)?;
        w.write_all(scratch)?;
    }
    Ok(())
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
fn push_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn encode_event(event: &Event, out: &mut Vec<u8>) {
    let tag = match &event.payload {
        Payload::BrushStroke(_) => TAG_BRUSH,
        Payload::ScatterStroke(_) => TAG_SCATTER,
        Payload::Gradient(_) => TAG_GRADIENT,
        Payload::ImageImport(_) => TAG_IMPORT,
        Payload::BufferCreate(_) => TAG_CREATE,
        Payload::BufferRemove(_) => TAG_REMOVE,
        Payload::BufferMerge(_) => TAG_MERGE,
        Payload::BufferMove(_) => TAG_MOVE,
        Payload::EventHide(_) => TAG_HIDE,
    };
    out.push(tag);
    push_u32(out, event.session().0);
    push_u32(out, event.seq());
    let mut flags = EventFlags::empty();
    flags.set(EventFlags::UNDONE, event.undone());
    out.push(flags.bits());
    match &event.payload {
        Payload::BrushStroke(stroke) | Payload::ScatterStroke(stroke) => {
            out.extend_from_slice(&stroke.color.to_rgba8());
            out.push(stroke.blend.mode.tag());
            push_f32(out, stroke.blend.opacity);
            push_f32(out, stroke.flow);
            push_f32(out, stroke.radius);
            push_u32(out, stroke.points.len() as u32);
            for point in &stroke.points {
                push_f32(out, point.x);
                push_f32(out, point.y);
                push_f32(out, point.pressure);
            }
        }
        Payload::Gradient(gradient) => {
            out.extend_from_slice(&gradient.color.to_rgba8());
            out.push(gradient.blend.mode.tag());
            push_f32(out, gradient.blend.opacity);
            push_f32(out, gradient.from[0]);
            push_f32(out, gradient.from[1]);
            push_f32(out, gradient.to[0]);
            push_f32(out, gradient.to[1]);
        }
        Payload::ImageImport(import) => {
            push_u32(out, import.at[0]);
            push_u32(out, import.at[1]);
            push_u32(out, import.image.width);
            push_u32(out, import.image.height);
            out.extend_from_slice(&import.image.pixels);
        }
        Payload::BufferCreate(create) => {
            push_u32(out, create.buffer.0);
            out.extend_from_slice(&create.clear_color.to_rgba8());
            out.push(u8::from(create.has_alpha));
        }
        Payload::BufferRemove(remove) => {
            push_u32(out, remove.buffer.0);
        }
        Payload::BufferMerge(merge) => {
            push_u32(out, merge.source.0);
            push_f32(out, merge.opacity);
        }
        Payload::BufferMove(stack_move) => {
            push_u32(out, stack_move.buffer.0);
            push_u32(out, stack_move.from as u32);
            push_u32(out, stack_move.to as u32);
        }
        Payload::EventHide(hide) => {
            push_u32(out, hide.session.0);
            push_u32(out, hide.seq);
        }
    }
}

/// Parse a picture serialized by [`write_picture`]. Unknown or malformed
/// event records are skipped with a diagnostic; buffers without a creation
/// event are dropped whole. All bitmaps start freed - call
/// [`Picture::regenerate_all`] or just compose to rebuild them.
pub fn read_picture<S: Surface, R: Read>(
    mut reader: R,
    options: &ReadOptions,
) -> Result<Picture<S>, ReadError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ReadError::BadMagic);
    }
    let mut r = CrcReader::new(reader);
    let version = read_u16(&mut r)?;
    if version != FORMAT_VERSION {
        return Err(ReadError::UnsupportedVersion(version));
    }
    let scale = options.scale;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(ReadError::Malformed("bitmap scale must be positive"));
    }
    let scale_dim = |v: u32| ((v as f32 * scale).round() as u32).max(1);
    let width = scale_dim(read_u32(&mut r)?);
    let height = scale_dim(read_u32(&mut r)?);
    let buffer_count = read_u32(&mut r)?;
    if buffer_count > MAX_BUFFERS {
        return Err(ReadError::Malformed("buffer count exceeds cap"));
    }
    let mut buffers = Vec::new();
    for _ in 0..buffer_count {
        if let Some(buffer) = read_buffer(&mut r, width, height, scale, options)? {
            if !buffer.session_order_ok() {
                log::warn!("{}: log violates per-session ordering", buffer.id());
            }
            buffers.push(buffer);
        }
    }
    let (mut reader, actual) = r.finish();
    let mut expected = [0u8; 4];
    reader.read_exact(&mut expected)?;
    if u32::from_le_bytes(expected) != actual {
        return Err(ReadError::ChecksumMismatch);
    }
    Ok(Picture::from_parts(
        width,
        height,
        options.session,
        options.policy,
        buffers,
    )?)
}

fn read_buffer<S: Surface, R: Read>(
    r: &mut R,
    width: u32,
    height: u32,
    scale: f32,
    options: &ReadOptions,
) -> Result<Option<Buffer<S>>, ReadError> {
    let id = BufferId(read_u32(r)?);
    let mut clear = [0u8; 4];
    r.read_exact(&mut clear)?;
    let flags = BufferFlags::from_bits_truncate(read_u8(r)?);
    let opacity = f32::from(read_u8(r)?) / 255.0;
    let insertion_offset = read_u32(r)? as usize;
    let event_count = read_u32(r)?;
    if event_count > MAX_EVENTS {
        return Err(ReadError::Malformed("event count exceeds cap"));
    }
    let mut events = Vec::new();
    for _ in 0..event_count {
        let len = read_u32(r)?;
        if len > MAX_RECORD {
            return Err(ReadError::Malformed("event record exceeds cap"));
        }
        let mut data = vec![0u8; len as usize];
        r.read_exact(&mut data)?;
        match decode_event(&data, scale) {
            Ok(event) => events.push(event),
            Err(why) => log::warn!("{id}: skipping event record: {why}"),
        }
    }
    // The creation event anchors the whole log.
    if events.first().and_then(Event::buffer_create).is_none() {
        log::warn!("{id}: dropping buffer without a creation event");
        return Ok(None);
    }
    let info = BufferCreate {
        buffer: id,
        clear_color: Color::from_rgba8(clear),
        has_alpha: flags.contains(BufferFlags::HAS_ALPHA),
    };
    let insertion_point = events.len().saturating_sub(insertion_offset);
    Ok(Some(Buffer::from_parts(
        width,
        height,
        options.policy,
        flags.contains(BufferFlags::UNDOABLE),
        info,
        events,
        insertion_point,
        opacity,
        flags.contains(BufferFlags::VISIBLE),
    )))
}

struct Cursor<'a> {
    data: &'a [u8],
}
impl<'a> Cursor<'a> {
    fn bytes(&mut self, count: usize) -> Result<&'a [u8], &'static str> {
        if self.data.len() < count {
            return Err("record truncated");
        }
        let (taken, rest) = self.data.split_at(count);
        self.data = rest;
        Ok(taken)
    }
    fn u8(&mut self) -> Result<u8, &'static str> {
        Ok(self.bytes(1)?[0])
    }
    fn u32(&mut self) -> Result<u32, &'static str> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    /// A float that must be finite to be meaningful.
    fn f32(&mut self) -> Result<f32, &'static str> {
        let value = f32::from_le_bytes(self.bytes(4)?.try_into().unwrap());
        if value.is_finite() {
            Ok(value)
        } else {
            Err("non-finite float")
        }
    }
    fn rgba8(&mut self) -> Result<Color, &'static str> {
        let bytes: [u8; 4] = self.bytes(4)?.try_into().unwrap();
        Ok(Color::from_rgba8(bytes))
    }
}

fn decode_event(data: &[u8], scale: f32) -> Result<Event, &'static str> {
    let mut c = Cursor { data };
    let tag = c.u8()?;
    let session = SessionId(c.u32()?);
    let seq = c.u32()?;
    let flags = EventFlags::from_bits_truncate(c.u8()?);
    let scale_at = |v: u32| (v as f32 * scale).round() as u32;
    let payload = match tag {
        TAG_BRUSH | TAG_SCATTER => {
            let color = c.rgba8()?;
            let mode =
                crate::blend::BlendMode::from_tag(c.u8()?).ok_or("unknown blend mode")?;
            let opacity = c.f32()?;
            let flow = c.f32()?;
            let radius = c.f32()? * scale;
            let count = c.u32()? as usize;
            // Each point is three floats; reject counts the record cannot hold.
            if count > c.data.len() / 12 {
                return Err("point count exceeds record");
            }
            let mut points = Vec::with_capacity(count);
            for _ in 0..count {
                points.push(StrokePoint {
                    x: c.f32()? * scale,
                    y: c.f32()? * scale,
                    pressure: c.f32()?,
                });
            }
            let stroke = BrushStroke {
                blend: crate::blend::Blend { mode, opacity },
                color,
                flow,
                radius,
                points,
            };
            if tag == TAG_BRUSH {
                Payload::BrushStroke(stroke)
            } else {
                Payload::ScatterStroke(stroke)
            }
        }
        TAG_GRADIENT => {
            let color = c.rgba8()?;
            let mode =
                crate::blend::BlendMode::from_tag(c.u8()?).ok_or("unknown blend mode")?;
            let opacity = c.f32()?;
            Payload::Gradient(Gradient {
                blend: crate::blend::Blend { mode, opacity },
                color,
                from: [c.f32()? * scale, c.f32()? * scale],
                to: [c.f32()? * scale, c.f32()? * scale],
            })
        }
        TAG_IMPORT => {
            let at = [scale_at(c.u32()?), scale_at(c.u32()?)];
            let width = c.u32()?;
            let height = c.u32()?;
            if width > MAX_IMAGE_DIM || height > MAX_IMAGE_DIM {
                return Err("image dimensions exceed cap");
            }
            let len = width as usize * height as usize * 4;
            let pixels = c.bytes(len)?.to_vec();
            Payload::ImageImport(ImageImport {
                image: ImageData {
                    width,
                    height,
                    pixels,
                },
                at,
            })
        }
        TAG_CREATE => {
            let buffer = BufferId(c.u32()?);
            let clear_color = c.rgba8()?;
            let has_alpha = c.u8()? != 0;
            Payload::BufferCreate(BufferCreate {
                buffer,
                clear_color,
                has_alpha,
            })
        }
        TAG_REMOVE => Payload::BufferRemove(BufferRemove {
            buffer: BufferId(c.u32()?),
        }),
        TAG_MERGE => Payload::BufferMerge(BufferMerge {
            source: BufferId(c.u32()?),
            opacity: c.f32()?,
        }),
        TAG_MOVE => Payload::BufferMove(BufferMove {
            buffer: BufferId(c.u32()?),
            from: c.u32()? as usize,
            to: c.u32()? as usize,
        }),
        TAG_HIDE => Payload::EventHide(EventHide {
            session: SessionId(c.u32()?),
            seq: c.u32()?,
        }),
        _ => return Err("unknown event type"),
    };
    // Trailing bytes are tolerated: a newer minor layout may append fields.
    Ok(if flags.contains(EventFlags::UNDONE) {
        Event::new_undone(session, seq, payload)
    } else {
        Event::new(session, seq, payload)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blend::{Blend, BlendMode};
    use crate::raster::CpuSurface;

    type TestPicture = Picture<CpuSurface>;

    const W: u32 = 16;
    const H: u32 = 16;
    const SID: SessionId = SessionId(7);

    fn sample_picture() -> TestPicture {
        let mut picture = TestPicture::new(W, H, SID).unwrap();
        for (id, clear, has_alpha) in [
            (1u32, [12, 23, 34, 255], false),
            (2, [0, 0, 0, 0], true),
        ] {
            let info = BufferCreate {
                buffer: BufferId(id),
                clear_color: Color::from_rgba8(clear),
                has_alpha,
            };
            let event = picture.make_event(Payload::BufferCreate(info));
            picture.push_event(BufferId(id), event).unwrap();
        }
        let stroke = picture.make_event(Payload::BrushStroke(BrushStroke {
            blend: Blend {
                mode: BlendMode::Normal,
                opacity: 0.8,
            },
            color: Color::from_rgba8([200, 40, 10, 255]),
            flow: 0.9,
            radius: 5.0,
            points: vec![
                StrokePoint {
                    x: 3.0,
                    y: 3.0,
                    pressure: 1.0,
                },
                StrokePoint {
                    x: 12.0,
                    y: 9.0,
                    pressure: 0.5,
                },
            ],
        }));
        let stroke_seq = stroke.seq();
        picture.push_event(BufferId(2), stroke).unwrap();
        let gradient = picture.make_event(Payload::Gradient(Gradient {
            blend: Blend {
                mode: BlendMode::Multiply,
                opacity: 1.0,
            },
            color: Color::from_rgba8([10, 200, 90, 255]),
            from: [0.0, 0.0],
            to: [16.0, 16.0],
        }));
        picture.push_event(BufferId(1), gradient).unwrap();
        let hide = picture.make_event(Payload::EventHide(EventHide {
            session: SID,
            seq: stroke_seq,
        }));
        picture.push_event(BufferId(2), hide).unwrap();
        let undone = picture.make_event(Payload::BrushStroke(BrushStroke {
            blend: Blend::default(),
            color: Color::WHITE,
            flow: 1.0,
            radius: 2.0,
            points: vec![StrokePoint {
                x: 8.0,
                y: 8.0,
                pressure: 1.0,
            }],
        }));
        let undone_seq = undone.seq();
        picture.push_event(BufferId(1), undone).unwrap();
        picture.undo_by_session_event(SID, undone_seq).unwrap();
        let scatter = picture.make_event(Payload::ScatterStroke(BrushStroke {
            blend: Blend {
                mode: BlendMode::Screen,
                opacity: 0.6,
            },
            color: Color::from_rgba8([30, 60, 90, 255]),
            flow: 0.4,
            radius: 3.0,
            points: vec![
                StrokePoint {
                    x: 2.0,
                    y: 14.0,
                    pressure: 1.0,
                },
                StrokePoint {
                    x: 14.0,
                    y: 2.0,
                    pressure: 0.75,
                },
            ],
        }));
        picture.push_event(BufferId(2), scatter).unwrap();
        let import = picture.make_event(Payload::ImageImport(ImageImport {
            image: ImageData {
                width: 2,
                height: 2,
                pixels: vec![255, 255, 255, 255, 0, 0, 0, 255, 9, 9, 9, 128, 1, 2, 3, 0],
            },
            at: [4, 4],
        }));
        picture.push_event(BufferId(1), import).unwrap();
        // An undone remove and an undone stack move: the records round-trip
        // while the picture's visible state stays put.
        let remove = picture.make_event(Payload::BufferRemove(BufferRemove {
            buffer: BufferId(2),
        }));
        let remove_seq = remove.seq();
        picture.push_event(BufferId(2), remove).unwrap();
        picture.undo_by_session_event(SID, remove_seq).unwrap();
        let stack_move = picture.make_event(Payload::BufferMove(BufferMove {
            buffer: BufferId(2),
            from: 1,
            to: 0,
        }));
        let move_seq = stack_move.seq();
        picture.push_event(BufferId(2), stack_move).unwrap();
        picture.undo_by_session_event(SID, move_seq).unwrap();
        picture
    }

    fn serialize(picture: &TestPicture) -> Vec<u8> {
        let mut out = Vec::new();
        write_picture(picture, &mut out).unwrap();
        out
    }

    fn frame(picture: &mut TestPicture) -> Vec<[u8; 4]> {
        let mut target = CpuSurface::new(W, H, Color::TRANSPARENT, true).unwrap();
        picture.compose_into(&mut target).unwrap();
        let mut out = Vec::new();
        for y in 0..H {
            for x in 0..W {
                out.push(target.pixel(x, y).to_rgba8());
            }
        }
        out
    }

    #[test]
    fn round_trip_reproduces_log_and_pixels() {
        let mut original = sample_picture();
        let bytes = serialize(&original);
        let mut parsed: TestPicture =
            read_picture(bytes.as_slice(), &ReadOptions::default()).unwrap();
        // Same buffers, same events, same order, same undone flags.
        assert_eq!(parsed.buffers().len(), original.buffers().len());
        for (a, b) in original.buffers().iter().zip(parsed.buffers()) {
            assert_eq!(a.id(), b.id());
            assert_eq!(a.events().len(), b.events().len());
            assert_eq!(a.insertion_point(), b.insertion_point());
            for (ea, eb) in a.events().iter().zip(b.events()) {
                assert_eq!(ea.session(), eb.session());
                assert_eq!(ea.seq(), eb.seq());
                assert_eq!(ea.undone(), eb.undone());
                assert_eq!(ea.payload, eb.payload);
            }
        }
        // Hide counters and merge links were rebuilt from the log.
        let stroke_hidden = parsed.buffers()[1]
            .events()
            .iter()
            .any(|e| e.hidden());
        assert!(stroke_hidden);
        // Replayed pixels match within blend-mode tolerance.
        let a = frame(&mut original);
        let b = frame(&mut parsed);
        for (pa, pb) in a.iter().zip(&b) {
            for ch in 0..4 {
                assert!((i32::from(pa[ch]) - i32::from(pb[ch])).abs() <= 1);
            }
        }
    }

    #[test]
    fn serializing_twice_is_identical() {
        let original = sample_picture();
        let first = serialize(&original);
        let second = serialize(&original);
        assert_eq!(first, second);
        // And a parse-then-serialize reproduces the same bytes too.
        let parsed: TestPicture =
            read_picture(first.as_slice(), &ReadOptions::default()).unwrap();
        assert_eq!(serialize(&parsed), first);
    }

    #[test]
    fn unknown_event_records_are_skipped() {
        // Hand-build a stream: one buffer, a creation record, then a record
        // with an unassigned tag.
        let mut body = Vec::new();
        body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        push_u32(&mut body, W);
        push_u32(&mut body, H);
        push_u32(&mut body, 1); // buffer count
        push_u32(&mut body, 9); // buffer id
        body.extend_from_slice(&[1, 2, 3, 255]); // clear color
        body.push((BufferFlags::UNDOABLE | BufferFlags::VISIBLE).bits());
        body.push(255); // opacity
        push_u32(&mut body, 0); // insertion offset
        push_u32(&mut body, 2); // event count
        let mut create = Vec::new();
        encode_event(
            &Event::new(
                SID,
                0,
                Payload::BufferCreate(BufferCreate {
                    buffer: BufferId(9),
                    clear_color: Color::from_rgba8([1, 2, 3, 255]),
                    has_alpha: false,
                }),
            ),
            &mut create,
        );
        push_u32(&mut body, create.len() as u32);
        body.extend_from_slice(&create);
        let unknown = [200u8, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0xAA, 0xBB];
        push_u32(&mut body, unknown.len() as u32);
        body.extend_from_slice(&unknown);
        let mut stream = MAGIC.to_vec();
        stream.extend_from_slice(&body);
        stream.extend_from_slice(&STREAM_CRC.checksum(&body).to_le_bytes());

        let parsed: TestPicture =
            read_picture(stream.as_slice(), &ReadOptions::default()).unwrap();
        assert_eq!(parsed.buffers().len(), 1);
        // The unknown record is gone, the rest of the log survives.
        assert_eq!(parsed.buffers()[0].events().len(), 1);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let original = sample_picture();
        let mut bytes = serialize(&original);
        let last = bytes.len() - 5;
        bytes[last] ^= 0x40;
        let result: Result<TestPicture, _> =
            read_picture(bytes.as_slice(), &ReadOptions::default());
        assert!(matches!(
            result,
            Err(ReadError::ChecksumMismatch) | Err(ReadError::Malformed(_))
        ));
    }

    #[test]
    fn newer_versions_are_rejected() {
        let original = sample_picture();
        let mut bytes = serialize(&original);
        bytes[4] = 0xFF;
        bytes[5] = 0x7F;
        let result: Result<TestPicture, _> =
            read_picture(bytes.as_slice(), &ReadOptions::default());
        assert!(matches!(result, Err(ReadError::UnsupportedVersion(_))));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let result: Result<TestPicture, _> =
            read_picture(&b"NOPEated"[..], &ReadOptions::default());
        assert!(matches!(result, Err(ReadError::BadMagic)));
    }

    #[test]
    fn load_scale_resizes_geometry() {
        let original = sample_picture();
        let bytes = serialize(&original);
        let parsed: TestPicture = read_picture(
            bytes.as_slice(),
            &ReadOptions {
                scale: 2.0,
                ..ReadOptions::default()
            },
        )
        .unwrap();
        assert_eq!((parsed.width(), parsed.height()), (W * 2, H * 2));
        let stroke = parsed.buffers()[1]
            .events()
            .iter()
            .find_map(|e| e.brush_stroke())
            .unwrap();
        assert!((stroke.radius - 10.0).abs() < 1e-5);
        assert!((stroke.points[0].x - 6.0).abs() < 1e-5);
    }
}
