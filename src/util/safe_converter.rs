//! Integer conversions for wire fields. Widening casts that can never lose information go through
//!  [SafeCast], narrowing casts whose range was checked beforehand go through [PrecheckedCast].

pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

macro_rules! safe_cast_impl {
    ($from:ty => $to:ty) => {
        impl SafeCast<$to> for $from {
            fn safe_cast(self) -> $to {
                self as $to
            }
        }
    }
}

safe_cast_impl!(u16 => usize);
#[cfg(not(target_pointer_width = "16"))]
safe_cast_impl!(u32 => usize);


/// NB: The implementations panic if the value does not fit, i.e. they rely on the caller having
///  validated the range (e.g. body length against the configured maximum packet size)
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

macro_rules! prechecked_cast_impl {
    ($from:ty => $to:ty) => {
        impl PrecheckedCast<$to> for $from {
            fn prechecked_cast(self) -> $to {
                <$to>::try_from(self)
                    .unwrap_or_else(|_| panic!("value {} out of range for {}: range should have been validated", self, stringify!($to)))
            }
        }
    }
}

prechecked_cast_impl!(usize => u16);
prechecked_cast_impl!(usize => u32);
