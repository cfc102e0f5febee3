use crate::channel::{ArgBlock, Channel};
use crate::engine::table::Translation;
use nix::unistd::Pid;

/// Apply a handler's translations to the scratch argument block, in
/// registration order. The first failing transform stops the pipeline but
/// is not a policy decision: the handler callback still runs with whatever
/// was translated so far. Returns the number of transforms applied.
pub fn apply<C: Channel>(
    channel: &mut C,
    pid: Pid,
    args: &mut ArgBlock,
    translations: &mut [Translation<C>],
) -> usize {
    for (idx, translation) in translations.iter_mut().enumerate() {
        let Some(raw) = args.get(translation.offset) else {
            log::debug!(
                "translation {} for pid {} references argument {} past the block, stopping",
                idx,
                pid,
                translation.offset
            );
            return idx;
        };

        match (translation.transform)(channel, pid, raw) {
            Ok(value) => {
                args.set(translation.offset, value);
            }
            Err(e) => {
                log::debug!(
                    "translation {} for pid {} argument {} failed, stopping: {}",
                    idx,
                    pid,
                    translation.offset,
                    e
                );
                return idx;
            }
        }
    }
    translations.len()
}
