use std::fmt;
use std::num::NonZeroU8;

/// Interest used in registering file descriptors with the loop's selector.
///
/// The loop only ever watches for read readiness (the wake channel is the
/// single registered descriptor), so this carries exactly that. The size
/// of `Option<Interest>` is identical to itself.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

const READABLE: u8 = 0b0001;

impl Interest {
    /// Returns `Interest` representing readable readiness.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Returns true if the value includes readable readiness.
    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_readable() {
            write!(fmt, "READABLE")?;
        }
        Ok(())
    }
}
