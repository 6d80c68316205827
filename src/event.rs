use core::marker::PhantomData;

/// A flag that can live in a [`Flags`] set.
pub trait Flag: Copy {
    fn bit(self) -> u16;
}

macro_rules! flags {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $bit:expr, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        $vis enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $crate::event::Flag for $name {
            fn bit(self) -> u16 {
                match self {
                    $( Self::$variant => 1 << $bit, )+
                }
            }
        }
    };
}

pub(crate) use flags;

/// Set of typed flags.
///
/// Used both for level status (`insert`/`remove`/`contains`) and for one-shot
/// edge events, which are consumed with [`take`](Flags::take) by the single
/// handler that owns them.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Flags<F: Flag> {
    bits: u16,
    _flag: PhantomData<F>,
}

impl<F: Flag> Flags<F> {
    pub const fn new() -> Self {
        Self {
            bits: 0,
            _flag: PhantomData,
        }
    }

    pub fn insert(&mut self, flag: F) {
        self.bits |= flag.bit();
    }

    pub fn remove(&mut self, flag: F) {
        self.bits &= !flag.bit();
    }

    pub fn set(&mut self, flag: F, on: bool) {
        if on {
            self.insert(flag)
        } else {
            self.remove(flag)
        }
    }

    pub fn contains(&self, flag: F) -> bool {
        self.bits & flag.bit() != 0
    }

    /// Clear `flag`, returning whether it was raised.
    pub fn take(&mut self, flag: F) -> bool {
        let raised = self.contains(flag);
        self.remove(flag);
        raised
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }
}

impl<F: Flag> Default for Flags<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Flag> core::fmt::Debug for Flags<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Flags({:#06x})", self.bits)
    }
}

#[cfg(feature = "defmt")]
impl<F: Flag> defmt::Format for Flags<F> {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(f, "Flags({=u16:#x})", self.bits)
    }
}
