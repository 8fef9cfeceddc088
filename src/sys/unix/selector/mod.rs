#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::epoll::{event, Event, Events, Selector};

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod poll;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) use self::poll::{event, Event, Events, Selector};
