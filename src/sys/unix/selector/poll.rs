//! Readiness backend built on `poll(2)` for platforms without epoll.

use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use crate::{Interest, Token};

#[derive(Debug)]
pub(crate) struct Selector {
    registrations: Mutex<Vec<Registration>>,
}

#[derive(Debug, Copy, Clone)]
struct Registration {
    fd: RawFd,
    token: Token,
    interests: Interest,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        Ok(Selector {
            registrations: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let registrations = self.registrations.lock().unwrap().clone();
        let mut pollfds: Vec<libc::pollfd> = registrations
            .iter()
            .map(|reg| libc::pollfd {
                fd: reg.fd,
                events: interests_to_poll(reg.interests),
                revents: 0,
            })
            .collect();

        let timeout = timeout
            .map(|to| {
                // Round up to avoid truncating sub-millisecond timeouts to
                // a busy-loop zero.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        syscall!(poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout,
        ))?;

        for (pollfd, reg) in pollfds.iter().zip(registrations.iter()) {
            if pollfd.revents != 0 {
                events.push(Event {
                    token: reg.token,
                    revents: pollfd.revents,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut registrations = self.registrations.lock().unwrap();
        if registrations.iter().any(|reg| reg.fd == fd) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        registrations.push(Registration {
            fd,
            token,
            interests,
        });
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut registrations = self.registrations.lock().unwrap();
        match registrations.iter().position(|reg| reg.fd == fd) {
            Some(index) => {
                registrations.swap_remove(index);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

fn interests_to_poll(interests: Interest) -> libc::c_short {
    let mut kind = 0;

    if interests.is_readable() {
        kind |= libc::POLLIN;
    }

    kind
}

#[derive(Debug)]
pub(crate) struct Event {
    token: Token,
    revents: libc::c_short,
}

pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use crate::sys::Event;
    use crate::Token;

    pub(crate) fn token(event: &Event) -> Token {
        event.token
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        (event.revents & (libc::POLLIN | libc::POLLHUP)) != 0
    }
}
