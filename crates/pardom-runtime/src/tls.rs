//! Thread-local domain context
//!
//! Every thread acting for a domain (the mutator thread, and the backup
//! thread while it stands in) carries the runtime and slot it belongs to.

use std::cell::Cell;

use crate::domain::Runtime;
use crate::registry::DomainSlot;

thread_local! {
    /// Runtime this thread's domain belongs to
    static RUNTIME_SELF: Cell<*const Runtime> = const { Cell::new(std::ptr::null()) };

    /// Slot of the domain this thread acts for
    static DOMAIN_SELF: Cell<*const DomainSlot> = const { Cell::new(std::ptr::null()) };
}

/// Bind this thread to a domain
pub fn set_domain_self(rt: &'static Runtime, slot: &'static DomainSlot) {
    RUNTIME_SELF.with(|c| c.set(rt as *const Runtime));
    DOMAIN_SELF.with(|c| c.set(slot as *const DomainSlot));
    pardom_core::dlog::set_domain_index(slot.id.as_u32());
}

/// Unbind this thread
pub fn clear_domain_self() {
    RUNTIME_SELF.with(|c| c.set(std::ptr::null()));
    DOMAIN_SELF.with(|c| c.set(std::ptr::null()));
    pardom_core::dlog::clear_domain_index();
}

/// The current thread's domain, if it has one.
///
/// The returned references are `'static`: runtimes are leaked at creation
/// and slots live inside them.
#[inline]
pub fn domain_self() -> Option<(&'static Runtime, &'static DomainSlot)> {
    let rt = RUNTIME_SELF.with(|c| c.get());
    let slot = DOMAIN_SELF.with(|c| c.get());
    if rt.is_null() || slot.is_null() {
        None
    } else {
        unsafe { Some((&*rt, &*slot)) }
    }
}

/// Whether the current thread acts for a domain
#[inline]
pub fn is_domain() -> bool {
    DOMAIN_SELF.with(|c| !c.get().is_null())
}
