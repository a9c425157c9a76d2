#![allow(clippy::declare_interior_mutable_const)]
use core::{cell::Cell, marker::PhantomData};

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`, usable in `static` initializers.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for PhantomData<T> {
    const INIT: Self = PhantomData;
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

macro_rules! impl_init {
    ( $( $ty:ty => $value:expr, )* ) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    usize => 0,
    isize => 0,
    () => (),
}
