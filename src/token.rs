/// Associates readiness events and loop handles with their owner.
///
/// `Token` is a wrapper around `usize` and is used both as the key of a
/// handle in the loop's internal slab and as the identifier carried by
/// selector events. The loop reserves `Token(usize::MAX)` for its wake
/// channel; handle tokens are slab indices and never collide with it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
