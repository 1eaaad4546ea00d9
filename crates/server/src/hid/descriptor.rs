//! HID report descriptor inspection
//!
//! Only the top-level usage is needed to tell the raw HID interface apart
//! from the keyboard and mouse interfaces of the same device.

const ITEM_TYPE_GLOBAL: u8 = 1;
const ITEM_TYPE_LOCAL: u8 = 2;
const TAG_USAGE_PAGE: u8 = 0;
const TAG_USAGE: u8 = 0;
const LONG_ITEM_PREFIX: u8 = 0xFE;

/// Top-level `(usage_page, usage)` declared by a report descriptor
///
/// Returns the first usage together with the usage page in effect at that
/// point, or `None` if the descriptor declares no usage.
pub fn top_level_usage(descriptor: &[u8]) -> Option<(u16, u16)> {
    let mut usage_page: Option<u16> = None;
    let mut i = 0;

    while i < descriptor.len() {
        let prefix = descriptor[i];

        if prefix == LONG_ITEM_PREFIX {
            let size = usize::from(*descriptor.get(i + 1)?);
            i += 3 + size;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => usize::from(n),
        };
        let item_type = (prefix >> 2) & 0x03;
        let tag = prefix >> 4;
        let data = descriptor.get(i + 1..i + 1 + size)?;
        let value = data
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));

        match (item_type, tag) {
            (ITEM_TYPE_GLOBAL, TAG_USAGE_PAGE) => usage_page = Some(value as u16),
            (ITEM_TYPE_LOCAL, TAG_USAGE) => {
                // Four-byte usages carry their own page in the high half
                if size == 4 {
                    return Some(((value >> 16) as u16, value as u16));
                }
                return Some((usage_page?, value as u16));
            }
            _ => {}
        }

        i += 1 + size;
    }

    None
}
