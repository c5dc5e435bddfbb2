//! Arena handles.
//!
//! Every IR entity lives in a `Vec` owned by the [`Module`](crate::Module) and
//! is addressed by a `u32` newtype. Handles are `Copy` and only meaningful
//! for the module that produced them.

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub(crate) fn from_index(index: usize) -> Self {
                Self(u32::try_from(index).unwrap_or_else(|_| {
                    panic!(concat!(stringify!($name), " arena overflow"))
                }))
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

define_id!(
    /// An SSA value: constant, parameter, instruction result or symbol address.
    ValueId
);
define_id!(
    /// An interned IR type.
    TypeId
);
define_id!(
    /// A basic block.
    BlockId
);
define_id!(
    /// A function (declared or defined).
    FunctionId
);
define_id!(
    /// A global constant.
    GlobalId
);
