//! Small bit-set newtypes for policy and status flags.

/// Declare a `Copy` bit-set newtype over `u32` with named flags.
///
/// The generated type supports `|`, `&`, `-` (difference), `contains`,
/// `intersects` and prints the names of the set flags in `Debug`.
macro_rules! flag_set {
  (
    $(#[$meta:meta])*
    $vis:vis struct $name:ident {
      $( $(#[$flag_meta:meta])* const $flag:ident = $value:expr; )*
    }
  ) => {
    $(#[$meta])*
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    $vis struct $name(u32);

    impl $name {
      pub const NONE: $name = $name(0);
      $( $(#[$flag_meta])* pub const $flag: $name = $name($value); )*

      const NAMED: &'static [(&'static str, $name)] = &[ $( (stringify!($flag), $name($value)) ),* ];

      pub const fn bits(self) -> u32 {
        self.0
      }

      pub const fn from_bits(bits: u32) -> Self {
        $name(bits)
      }

      pub const fn is_empty(self) -> bool {
        self.0 == 0
      }

      /// True if every flag in `other` is set.
      pub const fn contains(self, other: $name) -> bool {
        self.0 & other.0 == other.0
      }

      /// True if any flag in `other` is set.
      pub const fn intersects(self, other: $name) -> bool {
        self.0 & other.0 != 0
      }

      pub const fn union(self, other: $name) -> Self {
        $name(self.0 | other.0)
      }

      pub const fn difference(self, other: $name) -> Self {
        $name(self.0 & !other.0)
      }

      pub fn insert(&mut self, other: $name) {
        self.0 |= other.0;
      }

      pub fn remove(&mut self, other: $name) {
        self.0 &= !other.0;
      }

      /// Names of the single-bit flags that are set.
      pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
          .iter()
          .filter(|(_, value)| value.0.count_ones() == 1 && self.contains(*value))
          .map(|(flag, _)| *flag)
          .collect()
      }

      /// Look up a single flag by its (case-insensitive) name.
      pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMED
          .iter()
          .find(|(flag, _)| flag.eq_ignore_ascii_case(name))
          .map(|(_, value)| *value)
      }
    }

    impl std::ops::BitOr for $name {
      type Output = $name;
      fn bitor(self, rhs: $name) -> $name {
        self.union(rhs)
      }
    }

    impl std::ops::BitOrAssign for $name {
      fn bitor_assign(&mut self, rhs: $name) {
        self.insert(rhs);
      }
    }

    impl std::ops::BitAnd for $name {
      type Output = $name;
      fn bitand(self, rhs: $name) -> $name {
        $name(self.0 & rhs.0)
      }
    }

    impl std::ops::Sub for $name {
      type Output = $name;
      fn sub(self, rhs: $name) -> $name {
        self.difference(rhs)
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names();
        if names.is_empty() {
          write!(f, "{}(NONE)", stringify!($name))
        } else {
          write!(f, "{}({})", stringify!($name), names.join(" | "))
        }
      }
    }
  };
}

pub(crate) use flag_set;
