//! Names for raw keyword, opcode, level and task values.
//!
//! Windows defines a set of standard values (`winmeta.xml`) that every provider inherits;
//! providers may add their own or override them.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::event::Event;
use crate::utils::FastMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WinMeta {
    /// Keyword masks, iterated in ascending mask order.
    pub keywords: BTreeMap<u64, String>,
    pub opcodes: FastMap<u8, String>,
    pub levels: FastMap<u8, String>,
    pub tasks: FastMap<u16, String>,
}

impl WinMeta {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.opcodes.is_empty()
            && self.levels.is_empty()
            && self.tasks.is_empty()
    }
}

static DEFAULT_WIN_META: LazyLock<WinMeta> = LazyLock::new(|| {
    let keywords = [
        (0x1_0000_0000_0000, "Response Time"),
        (0x4_0000_0000_0000, "WDI Diag"),
        (0x8_0000_0000_0000, "SQM"),
        (0x10_0000_0000_0000, "Audit Failure"),
        (0x20_0000_0000_0000, "Audit Success"),
        (0x40_0000_0000_0000, "Correlation Hint"),
        (0x80_0000_0000_0000, "Classic"),
    ];
    let opcodes = [
        "Info", "Start", "Stop", "DCStart", "DCStop", "Extension", "Reply", "Resume", "Suspend",
        "Send",
    ];
    let levels = [
        "Information",
        "Critical",
        "Error",
        "Warning",
        "Information",
        "Verbose",
    ];

    WinMeta {
        keywords: keywords
            .into_iter()
            .map(|(mask, name)| (mask, name.to_owned()))
            .collect(),
        opcodes: (0u8..)
            .zip(opcodes)
            .map(|(v, name)| (v, name.to_owned()))
            .collect(),
        levels: (0u8..)
            .zip(levels)
            .map(|(v, name)| (v, name.to_owned()))
            .collect(),
        tasks: [(0u16, "None".to_owned())].into_iter().collect(),
    }
});

/// The standard Windows values.
pub fn default_win_meta() -> &'static WinMeta {
    &DEFAULT_WIN_META
}

fn push_keywords(table: &BTreeMap<u64, String>, remaining: &mut u64, out: &mut Vec<String>) {
    for (mask, name) in table {
        if *remaining & mask != 0 {
            out.push(name.clone());
            *remaining &= !mask;
        }
    }
}

/// Fill in the keyword, opcode, level and task names an event does not already carry.
///
/// Names already present (for example from `RenderingInfo`) are kept. Opcodes and levels prefer
/// the standard values, tasks prefer the provider's.
pub fn enrich_raw_values_with_names(provider: Option<&WinMeta>, event: &mut Event) {
    if event.keywords.is_empty() {
        let mut remaining = event.keywords_raw;
        push_keywords(
            &default_win_meta().keywords,
            &mut remaining,
            &mut event.keywords,
        );
        if let Some(provider) = provider {
            push_keywords(&provider.keywords, &mut remaining, &mut event.keywords);
        }
    }

    if event.opcode.is_empty() {
        if let Some(raw) = event.opcode_raw {
            let name = default_win_meta()
                .opcodes
                .get(&raw)
                .or_else(|| provider.and_then(|p| p.opcodes.get(&raw)));
            if let Some(name) = name {
                event.opcode = name.clone();
            }
        }
    }

    if event.level.is_empty() {
        let name = default_win_meta()
            .levels
            .get(&event.level_raw)
            .or_else(|| provider.and_then(|p| p.levels.get(&event.level_raw)));
        if let Some(name) = name {
            event.level = name.clone();
        }
    }

    if event.task.is_empty() {
        let name = provider
            .and_then(|p| p.tasks.get(&event.task_raw))
            .or_else(|| default_win_meta().tasks.get(&event.task_raw));
        if let Some(name) = name {
            event.task = name.clone();
        }
    }
}
