//! Lifetime-tied linear tokens and per-object strong counts.
//!
//! A token is a zero-sized proof that one strong reference was acquired
//! from a particular `StrongCount`. Dropping a token panics; the only valid
//! way to dispose of it is to hand it back through `StrongCount::release`.

use core::cell::Cell;
use core::marker::PhantomData;

/// Zero-sized, linear token tied to its originating counter via lifetime.
pub struct Token<'a, C: ?Sized> {
    // Lifetime is tracked separately from the counter type to avoid
    // imposing `'a` bounds on `C`.
    _lt: PhantomData<&'a ()>,
    _ctr: PhantomData<*const C>,
}

impl<'a, C: ?Sized> Token<'a, C> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            _lt: PhantomData,
            _ctr: PhantomData,
        }
    }
}

impl<'a, C: ?Sized> Drop for Token<'a, C> {
    fn drop(&mut self) {
        // Fail fast on misuse: a token must go back through release().
        panic!("Token dropped without StrongCount::release");
    }
}

impl<'a, C: ?Sized> core::fmt::Debug for Token<'a, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Token")
    }
}

/// Returning a token would take the count below zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Underflow;

/// Single-threaded strong count of one heap object.
#[derive(Debug)]
pub struct StrongCount {
    count: Cell<usize>,
}

impl StrongCount {
    pub fn new() -> Self {
        Self {
            count: Cell::new(0),
        }
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.count.get()
    }

    /// Acquire one strong reference and return a linear token for it.
    ///
    /// Tokens are minted with a `'static` lifetime; they stay branded to
    /// this counter by type and shorten covariantly when released.
    #[inline]
    pub fn acquire(&self) -> Token<'static, Self> {
        let n = self.count.get().wrapping_add(1);
        self.count.set(n);
        if n == 0 {
            // Same policy as Rc: overflow aborts.
            std::process::abort();
        }
        Token::new()
    }

    /// Consume a token. Returns `Ok(true)` when the count reached zero.
    #[inline]
    pub fn release<'a>(&'a self, t: Token<'a, Self>) -> Result<bool, Underflow> {
        core::mem::forget(t);
        let c = self.count.get();
        if c == 0 {
            return Err(Underflow);
        }
        self.count.set(c - 1);
        Ok(c == 1)
    }
}

impl Default for StrongCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reports_zero() {
        let c = StrongCount::new();
        let a = c.acquire();
        let b = c.acquire();
        assert_eq!(c.get(), 2);
        assert_eq!(c.release(a), Ok(false));
        assert_eq!(c.release(b), Ok(true));
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn release_on_zero_is_underflow() {
        let c = StrongCount::new();
        // A forged token stands in for a double release.
        let forged: Token<'static, StrongCount> = Token::new();
        assert_eq!(c.release(forged), Err(Underflow));
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn dropping_token_panics() {
        let res = std::panic::catch_unwind(|| {
            let c = StrongCount::new();
            let _t = c.acquire();
        });
        assert!(res.is_err(), "leaked token must panic on drop");
    }
}
