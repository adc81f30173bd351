/// Mixed-radix counter used to walk the bank -> bank group -> rank -> channel hierarchy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digit {
  pub value: usize,
  pub modulus: usize,
  pub step: usize,
}

/// Digits are stored least significant first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Odometer {
  digits: Vec<Digit>,
}

impl Odometer {
  /// Build from `(modulus, step)` pairs, least significant first.
  pub fn new(radix: &[(usize, usize)]) -> Self {
    Self {
      digits: radix
        .iter()
        .map(|&(modulus, step)| Digit {
          value: 0,
          modulus: modulus.max(1),
          step: step.max(1),
        })
        .collect(),
    }
  }

  /// Advance the least significant digit and propagate carries.
  ///
  /// Returns true when the most significant digit wraps back to zero.
  pub fn tick(&mut self) -> bool {
    for digit in self.digits.iter_mut() {
      digit.value += digit.step;
      if digit.value < digit.modulus {
        return false;
      }
      digit.value = 0;
    }
    true
  }

  pub fn value(&self, idx: usize) -> usize {
    self.digits.get(idx).map_or(0, |d| d.value)
  }

  pub fn is_zero(&self) -> bool {
    self.digits.iter().all(|d| d.value == 0)
  }

  /// Ticks between two wraps of the most significant digit.
  pub fn period(&self) -> usize {
    self
      .digits
      .iter()
      .map(|d| d.modulus.div_ceil(d.step))
      .product()
  }
}

/// Running start position of one tile parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
  pub row: usize,
  pub col: usize,
}

impl Cursor {
  /// Next column. Columns past the end of a row are folded by the address function.
  pub fn advance(&mut self) {
    self.col += 1;
  }
}
