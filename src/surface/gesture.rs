//! Push 2 input decoding.
use tracing::debug;

/// First and last pad note numbers.
pub const FIRST_PAD_NOTE: u8 = 36;
pub const LAST_PAD_NOTE: u8 = 99;

pub const CC_TEMPO: u8 = 14;
pub const CC_SWING: u8 = 15;
pub const CC_MUTE_SOLO_PADS: u8 = 20;
pub const CC_REPEAT_LAST: u8 = 43;
pub const CC_REPEAT_FIRST: u8 = 36;
pub const CC_OCTAVE_DOWN: u8 = 54;
pub const CC_OCTAVE_UP: u8 = 55;
pub const CC_TRACK_ENCODERS: u8 = 71;
pub const CC_CHANNEL_SELECT: u8 = 102;

/// Momentary/toggle buttons with both press and release reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Play,
    Record,
    Duplicate,
    Automate,
    Delete,
    Select,
    Accent,
    Scale,
    User,
    Mute,
    Solo,
}

impl Function {
    pub const ALL: [Function; 11] = [
        Function::Play,
        Function::Record,
        Function::Duplicate,
        Function::Automate,
        Function::Delete,
        Function::Select,
        Function::Accent,
        Function::Scale,
        Function::User,
        Function::Mute,
        Function::Solo,
    ];

    pub fn cc(self) -> u8 {
        match self {
            Function::Play => 85,
            Function::Record => 86,
            Function::Duplicate => 88,
            Function::Automate => 89,
            Function::Delete => 118,
            Function::Select => 48,
            Function::Accent => 57,
            Function::Scale => 58,
            Function::User => 59,
            Function::Mute => 60,
            Function::Solo => 61,
        }
    }

    pub fn from_cc(cc: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.cc() == cc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Tempo,
    Swing,
    /// One of the eight encoders above the display, 0..8.
    Track(usize),
}

/// Everything the surface can tell us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    /// Pad index 0..64, 0 is the top-left pad.
    PadOn { index: usize, velocity: u8 },
    PadOff { index: usize },
    FunctionOn(Function),
    FunctionOff(Function),
    Octave(Direction),
    Encoder { encoder: Encoder, delta: i32 },
    ChannelSelect(usize),
    MuteSoloPad(usize),
    /// Repeat rate index 0..8, 0 is a quarter note.
    RepeatOn(usize),
    RepeatOff(usize),
    Pressure(u8),
    PitchBend { lsb: u8, msb: u8 },
}

/// Pad note number to linear matrix index.
pub fn pad_index(note: u8) -> Option<usize> {
    if !(FIRST_PAD_NOTE..=LAST_PAD_NOTE).contains(&note) {
        return None;
    }
    let offset = (note - FIRST_PAD_NOTE) as usize;
    Some((7 - offset / 8) * 8 + offset % 8)
}

/// Matrix index to pad note number.
pub fn pad_note(index: usize) -> u8 {
    let (row, col) = (index / 8, index % 8);
    FIRST_PAD_NOTE + ((7 - row.min(7)) * 8 + col) as u8
}

/// Relative encoder value: 1..63 clockwise, 127..64 counter-clockwise.
pub fn relative(value: u8) -> i32 {
    if value < 64 {
        value as i32
    } else {
        value as i32 - 128
    }
}

pub fn decode(bytes: &[u8]) -> Option<Gesture> {
    let status = *bytes.first()?;
    let data1 = bytes.get(1).copied().unwrap_or(0);
    let data2 = bytes.get(2).copied().unwrap_or(0);

    let gesture = match status & 0xF0 {
        0x90 => pad_index(data1).map(|index| {
            if data2 == 0 {
                Gesture::PadOff { index }
            } else {
                Gesture::PadOn {
                    index,
                    velocity: data2,
                }
            }
        }),
        0x80 => pad_index(data1).map(|index| Gesture::PadOff { index }),
        0xB0 => decode_cc(data1, data2),
        0xA0 => Some(Gesture::Pressure(data2)),
        0xD0 => Some(Gesture::Pressure(data1)),
        0xE0 => Some(Gesture::PitchBend {
            lsb: data1,
            msb: data2,
        }),
        _ => None,
    };
    if gesture.is_none() {
        debug!(?bytes, "unhandled surface message");
    }
    gesture
}

fn decode_cc(cc: u8, value: u8) -> Option<Gesture> {
    let pressed = value > 0;
    if let Some(function) = Function::from_cc(cc) {
        return Some(if pressed {
            Gesture::FunctionOn(function)
        } else {
            Gesture::FunctionOff(function)
        });
    }
    match cc {
        CC_OCTAVE_UP if pressed => Some(Gesture::Octave(Direction::Up)),
        CC_OCTAVE_DOWN if pressed => Some(Gesture::Octave(Direction::Down)),
        CC_TEMPO => Some(Gesture::Encoder {
            encoder: Encoder::Tempo,
            delta: relative(value),
        }),
        CC_SWING => Some(Gesture::Encoder {
            encoder: Encoder::Swing,
            delta: relative(value),
        }),
        71..=78 => Some(Gesture::Encoder {
            encoder: Encoder::Track((cc - CC_TRACK_ENCODERS) as usize),
            delta: relative(value),
        }),
        102..=109 if pressed => Some(Gesture::ChannelSelect((cc - CC_CHANNEL_SELECT) as usize)),
        20..=27 if pressed => Some(Gesture::MuteSoloPad((cc - CC_MUTE_SOLO_PADS) as usize)),
        CC_REPEAT_FIRST..=CC_REPEAT_LAST => {
            let index = (CC_REPEAT_LAST - cc) as usize;
            Some(if pressed {
                Gesture::RepeatOn(index)
            } else {
                Gesture::RepeatOff(index)
            })
        }
        _ => None,
    }
}
