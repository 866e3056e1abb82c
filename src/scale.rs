//! Mapping between the two rows of note pads and MIDI pitches.
use serde::{Deserialize, Serialize};

pub const ROWS: usize = 2;
pub const COLS: usize = 8;

pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];
pub const MIN_OCTAVE: i32 = 0;
pub const MAX_OCTAVE: i32 = 9;

/// Name with octave, middle C (60) is "C4".
pub fn pitch_name(pitch: u8) -> String {
    let octave = pitch as i32 / 12 - 1;
    format!("{}{octave}", NOTE_NAMES[pitch as usize % 12])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scale {
    #[serde(rename = "chromatic")]
    Chromatic,
    #[serde(rename = "min")]
    Minor,
    #[serde(rename = "min-m")]
    MelodicMinor,
    #[serde(rename = "min-h")]
    HarmonicMinor,
    #[serde(rename = "maj")]
    Major,
}

impl Scale {
    pub const ALL: [Scale; 5] = [
        Scale::Chromatic,
        Scale::Minor,
        Scale::MelodicMinor,
        Scale::HarmonicMinor,
        Scale::Major,
    ];

    /// Seven semitone offsets, or `None` for the keyboard layout.
    pub fn steps(self) -> Option<&'static [i32; 7]> {
        match self {
            Scale::Chromatic => None,
            Scale::Minor => Some(&[0, 2, 3, 5, 7, 8, 10]),
            Scale::MelodicMinor => Some(&[0, 2, 3, 5, 7, 9, 11]),
            Scale::HarmonicMinor => Some(&[0, 2, 3, 5, 7, 8, 11]),
            Scale::Major => Some(&[0, 2, 4, 5, 7, 9, 11]),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scale::Chromatic => "chromatic",
            Scale::Minor => "min",
            Scale::MelodicMinor => "min-m",
            Scale::HarmonicMinor => "min-h",
            Scale::Major => "maj",
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

// Keyboard layout: naturals on the lower row, accidentals above them.
const CHROMATIC_KEYS: [[Option<i32>; COLS]; ROWS] = [
    [Some(0), Some(2), Some(4), Some(5), Some(7), Some(9), Some(11), Some(12)],
    [None, Some(1), Some(3), None, Some(6), Some(8), Some(10), None],
];

/// Semitone 0..=12 -> (row, col) in [`CHROMATIC_KEYS`].
const CHROMATIC_SLOTS: [(usize, usize); 13] = [
    (0, 0), (1, 1), (0, 1), (1, 2),
    (0, 2), (0, 3), (1, 4), (0, 4),
    (1, 5), (0, 5), (1, 6), (0, 6),
    (0, 7),
];

/// Scale, root pitch class and octave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleContext {
    #[serde(rename = "currentScale")]
    pub scale: Scale,
    #[serde(rename = "currentRootNote", with = "root_name")]
    pub root: u8,
    #[serde(rename = "currentOctave")]
    pub octave: i32,
}

impl Default for ScaleContext {
    fn default() -> Self {
        Self {
            scale: Scale::Minor,
            root: 0,
            octave: 3,
        }
    }
}

/// Bidirectional pad <-> pitch mapping under a [`ScaleContext`].
///
/// Row 1 is the upper pad row. In scale modes (row 0, col 7) and (row 1, col 0)
/// land on the same pitch; [`ScaleMapper::grid_for`] answers (row 1, col 0).
#[derive(Debug, Clone, Default)]
pub struct ScaleMapper {
    context: ScaleContext,
}

impl ScaleMapper {
    pub fn new(context: ScaleContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> ScaleContext {
        self.context
    }

    pub fn set_context(&mut self, context: ScaleContext) {
        self.context = ScaleContext {
            root: context.root.min(11),
            octave: context.octave.clamp(MIN_OCTAVE, MAX_OCTAVE),
            ..context
        };
    }

    pub fn octave(&self) -> i32 {
        self.context.octave
    }

    pub fn set_octave(&mut self, octave: i32) {
        self.context.octave = octave.clamp(MIN_OCTAVE, MAX_OCTAVE);
    }

    pub fn scale(&self) -> Scale {
        self.context.scale
    }

    pub fn root_name(&self) -> &'static str {
        NOTE_NAMES[self.context.root as usize % 12]
    }

    pub fn pitch_for(&self, row: usize, col: usize) -> Option<u8> {
        if row >= ROWS || col >= COLS {
            return None;
        }
        let ScaleContext { scale, root, octave } = self.context;
        let pitch = match scale.steps() {
            None => octave * 12 + CHROMATIC_KEYS[row][col]?,
            Some(steps) => {
                let extra_octave = (col / 7) as i32;
                (octave + extra_octave + row as i32) * 12 + root as i32 + steps[col % 7]
            }
        };
        u8::try_from(pitch).ok().filter(|p| *p <= 127)
    }

    pub fn grid_for(&self, pitch: u8) -> Option<(usize, usize)> {
        let ScaleContext { scale, root, octave } = self.context;
        let offset = pitch as i32 - octave * 12;
        match scale.steps() {
            None => {
                let slot = usize::try_from(offset).ok()?;
                CHROMATIC_SLOTS.get(slot).copied()
            }
            Some(steps) => {
                let offset = offset - root as i32;
                if !(0..24).contains(&offset) {
                    // the one pad two octaves up
                    return (offset == 24).then_some((1, 7));
                }
                let row = (offset / 12) as usize;
                let col = steps.iter().position(|s| *s == offset % 12)?;
                Some((row, col))
            }
        }
    }

    /// Every pad that plays `pitch`.
    pub fn positions_for(&self, pitch: u8) -> Vec<(usize, usize)> {
        let mut positions = Vec::new();
        for row in 0..ROWS {
            for col in 0..COLS {
                if self.pitch_for(row, col) == Some(pitch) {
                    positions.push((row, col));
                }
            }
        }
        positions
    }

    pub fn octave_up(&mut self) {
        self.set_octave(self.context.octave + 1);
    }

    pub fn octave_down(&mut self) {
        self.set_octave(self.context.octave - 1);
    }

    pub fn edit_root_note(&mut self, delta: i32) {
        self.context.root = (self.context.root as i32 + delta).clamp(0, 11) as u8;
    }

    pub fn edit_scale(&mut self, delta: i32) {
        let last = Scale::ALL.len() as i32 - 1;
        let index = (self.context.scale.index() as i32 + delta).clamp(0, last);
        self.context.scale = Scale::ALL[index as usize];
    }
}

/// Roots persist as note names ("C", "F#").
mod root_name {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::NOTE_NAMES;

    pub fn serialize<S>(root: &u8, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(NOTE_NAMES[*root as usize % 12])
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        NOTE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| i as u8)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown root note {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(scale: Scale, root: u8, octave: i32) -> ScaleMapper {
        ScaleMapper::new(ScaleContext { scale, root, octave })
    }

    #[test]
    fn test_pitch_name() {
        assert_eq!(pitch_name(60), "C4");
        assert_eq!(pitch_name(39), "D#2");
        assert_eq!(pitch_name(0), "C-1");
        assert_eq!(pitch_name(127), "G9");
    }

    #[test]
    fn test_minor_layout() {
        let m = mapper(Scale::Minor, 0, 3);
        assert_eq!(m.pitch_for(0, 0), Some(36));
        assert_eq!(m.pitch_for(0, 2), Some(39));
        assert_eq!(m.pitch_for(0, 7), Some(48));
        assert_eq!(m.pitch_for(1, 0), Some(48));
        assert_eq!(m.pitch_for(1, 7), Some(60));
        assert_eq!(m.pitch_for(2, 0), None);
    }

    #[test]
    fn test_root_offsets_scale() {
        let m = mapper(Scale::Major, 7, 4);
        assert_eq!(m.pitch_for(0, 0), Some(55));
        assert_eq!(m.pitch_for(0, 6), Some(66));
    }

    #[test]
    fn test_out_of_range_has_no_pitch() {
        let m = mapper(Scale::Major, 11, 9);
        // 9*12 + 12 + 11 = 131 on the upper row
        assert_eq!(m.pitch_for(1, 0), None);
        assert!(m.pitch_for(0, 0).is_some());
    }

    #[test]
    fn test_chromatic_layout() {
        let m = mapper(Scale::Chromatic, 5, 4);
        assert_eq!(m.pitch_for(0, 0), Some(48));
        assert_eq!(m.pitch_for(1, 1), Some(49));
        assert_eq!(m.pitch_for(1, 0), None);
        assert_eq!(m.pitch_for(1, 3), None);
        assert_eq!(m.pitch_for(0, 7), Some(60));
    }

    #[test]
    fn test_round_trip_every_context() {
        for scale in Scale::ALL {
            for root in 0..12u8 {
                for octave in MIN_OCTAVE..=MAX_OCTAVE {
                    let m = mapper(scale, root, octave);
                    for row in 0..ROWS {
                        for col in 0..COLS {
                            let Some(pitch) = m.pitch_for(row, col) else {
                                continue;
                            };
                            let back = m.grid_for(pitch).expect("reachable pitch has a pad");
                            assert_eq!(m.pitch_for(back.0, back.1), Some(pitch));
                            let aliased = scale != Scale::Chromatic && (row, col) == (0, 7);
                            if aliased {
                                assert_eq!(back, (1, 0));
                            } else {
                                assert_eq!(back, (row, col), "{scale:?} {root} {octave}");
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_unreachable_pitch_has_no_pad() {
        let m = mapper(Scale::Minor, 0, 3);
        assert_eq!(m.grid_for(37), None);
        assert_eq!(m.grid_for(10), None);
        assert_eq!(m.grid_for(90), None);
        let c = mapper(Scale::Chromatic, 0, 3);
        assert_eq!(c.grid_for(35), None);
        assert_eq!(c.grid_for(49), None);
    }

    #[test]
    fn test_positions_include_alias() {
        let m = mapper(Scale::Minor, 0, 3);
        assert_eq!(m.positions_for(48), vec![(0, 7), (1, 0)]);
        assert_eq!(m.positions_for(39), vec![(0, 2)]);
    }

    #[test]
    fn test_bounded_walks() {
        let mut m = ScaleMapper::default();
        for _ in 0..20 {
            m.octave_up();
        }
        assert_eq!(m.octave(), MAX_OCTAVE);
        for _ in 0..20 {
            m.octave_down();
        }
        assert_eq!(m.octave(), MIN_OCTAVE);

        m.edit_root_note(-3);
        assert_eq!(m.root_name(), "C");
        m.edit_root_note(30);
        assert_eq!(m.root_name(), "B");

        m.edit_scale(-1);
        assert_eq!(m.scale(), Scale::Chromatic);
        m.edit_scale(2);
        assert_eq!(m.scale(), Scale::MelodicMinor);
        m.edit_scale(10);
        assert_eq!(m.scale(), Scale::Major);
    }

    #[test]
    fn test_context_json() {
        let ctx = ScaleContext {
            scale: Scale::HarmonicMinor,
            root: 6,
            octave: 2,
        };
        let json = serde_json::to_value(ctx).unwrap();
        assert_eq!(json["currentScale"], "min-h");
        assert_eq!(json["currentRootNote"], "F#");
        assert_eq!(json["currentOctave"], 2);
        let back: ScaleContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }
}
