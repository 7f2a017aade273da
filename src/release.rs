//! Resource release for singleton instances.
//!
//! An instance is released at most once. Either the owner calls
//! [`Singleton::dispose`](crate::Singleton::dispose), which releases with
//! [`ReleaseKind::Explicit`], or the owning [`Singleton`](crate::Singleton) is dropped
//! without having been disposed, which releases with [`ReleaseKind::Finalizer`].
//! A process-wide `static` singleton is never dropped; releasing it is up to the
//! caller.

/// Why an instance is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseKind {
   /// Released by an explicit `dispose` call. Other resources the instance owns may
   /// still be released safely.
   Explicit,
   /// Released because the owner was dropped without disposing. Only resources held
   /// directly by the instance should be touched.
   Finalizer,
}

/// Cleanup hook for values held by a [`Singleton`](crate::Singleton).
///
/// The default does nothing, so types without resources only need an empty impl.
pub trait Release {
   fn release(&self, kind: ReleaseKind) {
      let _ = kind;
   }
}
