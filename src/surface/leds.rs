//! LED colors, last-sent state and the raw messages that set them.
use super::gesture::pad_note;

/// Logical palette. The discriminant order is the palette slot uploaded to
/// the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Color {
    #[default]
    Off,
    White,
    DimWhite,
    Red,
    LightRed,
    Orange,
    Yellow,
    Green,
    LightGreen,
    Blue,
    LightBlue,
    Cyan,
    LightCyan,
    Pink,
    Purple,
    DarkRed,
    DarkGreen,
    DarkBlue,
    Amber,
    Lime,
    Teal,
    Magenta,
    Violet,
    Gray,
}

impl Color {
    pub const ALL: [Color; 24] = [
        Color::Off,
        Color::White,
        Color::DimWhite,
        Color::Red,
        Color::LightRed,
        Color::Orange,
        Color::Yellow,
        Color::Green,
        Color::LightGreen,
        Color::Blue,
        Color::LightBlue,
        Color::Cyan,
        Color::LightCyan,
        Color::Pink,
        Color::Purple,
        Color::DarkRed,
        Color::DarkGreen,
        Color::DarkBlue,
        Color::Amber,
        Color::Lime,
        Color::Teal,
        Color::Magenta,
        Color::Violet,
        Color::Gray,
    ];

    /// Palette slot.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// `(red, green, blue, white)`, 0..=255 each.
    pub fn rgbw(self) -> (u8, u8, u8, u8) {
        match self {
            Color::Off => (0, 0, 0, 0),
            Color::White => (255, 255, 255, 255),
            Color::DimWhite => (40, 40, 40, 40),
            Color::Red => (255, 0, 0, 0),
            Color::LightRed => (255, 90, 90, 40),
            Color::Orange => (255, 100, 0, 0),
            Color::Yellow => (255, 220, 0, 0),
            Color::Green => (0, 255, 0, 0),
            Color::LightGreen => (120, 255, 120, 40),
            Color::Blue => (0, 0, 255, 0),
            Color::LightBlue => (90, 140, 255, 40),
            Color::Cyan => (0, 255, 255, 0),
            Color::LightCyan => (150, 255, 255, 60),
            Color::Pink => (255, 80, 160, 0),
            Color::Purple => (140, 0, 255, 0),
            Color::DarkRed => (60, 0, 0, 0),
            Color::DarkGreen => (0, 60, 0, 0),
            Color::DarkBlue => (0, 0, 60, 0),
            Color::Amber => (255, 160, 0, 0),
            Color::Lime => (160, 255, 0, 0),
            Color::Teal => (0, 160, 128, 0),
            Color::Magenta => (255, 0, 255, 0),
            Color::Violet => (200, 120, 255, 0),
            Color::Gray => (100, 100, 100, 60),
        }
    }

    /// RGB for on-screen rendering.
    pub fn rgb(self) -> [u8; 3] {
        let (r, g, b, _) = self.rgbw();
        [r, g, b]
    }
}

/// Surface MIDI channel used for a blinking LED.
pub const BLINK_CHANNEL: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedEntry {
    /// Animation channel, 0 for a steady light.
    pub blink: u8,
    pub color: Color,
}

impl LedEntry {
    pub const OFF: LedEntry = LedEntry::solid(Color::Off);

    pub const fn solid(color: Color) -> Self {
        Self { blink: 0, color }
    }

    pub const fn blinking(color: Color) -> Self {
        Self {
            blink: BLINK_CHANNEL,
            color,
        }
    }
}

/// Last-sent LED values for a fixed set of slots.
#[derive(Debug, Clone)]
pub struct LedBank {
    sent: Vec<LedEntry>,
}

impl LedBank {
    pub fn new(slots: usize) -> Self {
        Self {
            sent: vec![LedEntry::OFF; slots],
        }
    }

    pub fn get(&self, index: usize) -> Option<LedEntry> {
        self.sent.get(index).copied()
    }

    /// Record `entry` for `index`. Returns true if it differs from what was
    /// last sent.
    pub fn update(&mut self, index: usize, entry: LedEntry) -> bool {
        match self.sent.get_mut(index) {
            Some(current) if *current != entry => {
                *current = entry;
                true
            }
            _ => false,
        }
    }

    /// Slots of `desired` that changed, recorded as sent.
    pub fn diff(&mut self, desired: &[LedEntry]) -> Vec<(usize, LedEntry)> {
        desired
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| self.update(index, *entry).then_some((index, *entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

pub fn pad_message(index: usize, entry: LedEntry) -> [u8; 3] {
    [0x90 | (entry.blink & 0x0F), pad_note(index), entry.color.index()]
}

pub fn button_message(cc: u8, entry: LedEntry) -> [u8; 3] {
    [0xB0 | (entry.blink & 0x0F), cc & 0x7F, entry.color.index()]
}

const SYSEX_HEADER: [u8; 6] = [0xF0, 0x00, 0x21, 0x1D, 0x01, 0x01];
const SET_PALETTE_ENTRY: u8 = 0x03;
const REAPPLY_PALETTE: u8 = 0x05;

/// One palette slot: each 8-bit component goes out as low 7 bits, high bit.
pub fn palette_entry(color: Color) -> Vec<u8> {
    let (r, g, b, w) = color.rgbw();
    let mut msg = SYSEX_HEADER.to_vec();
    msg.push(SET_PALETTE_ENTRY);
    msg.push(color.index());
    for component in [r, g, b, w] {
        msg.push(component & 0x7F);
        msg.push(component >> 7);
    }
    msg.push(0xF7);
    msg
}

pub fn reapply_palette() -> Vec<u8> {
    let mut msg = SYSEX_HEADER.to_vec();
    msg.push(REAPPLY_PALETTE);
    msg.push(0xF7);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette_slots_match_order() {
        for (i, color) in Color::ALL.iter().enumerate() {
            assert_eq!(color.index() as usize, i);
        }
    }

    #[test]
    fn test_palette_entry_layout() {
        let msg = palette_entry(Color::White);
        assert_eq!(
            msg,
            vec![
                0xF0, 0x00, 0x21, 0x1D, 0x01, 0x01, 0x03, 1, 0x7F, 1, 0x7F, 1, 0x7F, 1, 0x7F, 1,
                0xF7
            ]
        );
        assert_eq!(reapply_palette(), vec![0xF0, 0x00, 0x21, 0x1D, 0x01, 0x01, 0x05, 0xF7]);
    }

    #[test]
    fn test_messages() {
        assert_eq!(pad_message(0, LedEntry::solid(Color::Red)), [0x90, 92, 3]);
        assert_eq!(pad_message(63, LedEntry::blinking(Color::Green)), [0x9E, 43, 7]);
        assert_eq!(button_message(85, LedEntry::solid(Color::Green)), [0xB0, 85, 7]);
    }

    #[test]
    fn test_bank_diff() {
        let mut bank = LedBank::new(4);
        let desired = [
            LedEntry::OFF,
            LedEntry::solid(Color::Blue),
            LedEntry::OFF,
            LedEntry::blinking(Color::Blue),
        ];
        let changed = bank.diff(&desired);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].0, 1);
        assert!(bank.diff(&desired).is_empty());
        assert!(!bank.update(9, LedEntry::solid(Color::Red)));
        assert_eq!(bank.get(3), Some(LedEntry::blinking(Color::Blue)));
    }
}
