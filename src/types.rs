use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ast::Expression;
use crate::symbol_table::{SymbolId, SymbolTable};

/// Built-in numeric kinds in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NumericKind {
    Bool,
    SByte,
    UByte,
    Int32,
    Int64,
    Float64,
}

impl NumericKind {
    pub const ALL: [NumericKind; 6] = [
        NumericKind::Bool,
        NumericKind::SByte,
        NumericKind::UByte,
        NumericKind::Int32,
        NumericKind::Int64,
        NumericKind::Float64,
    ];

    pub fn larger_of(a: NumericKind, b: NumericKind) -> NumericKind {
        a.max(b)
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            NumericKind::SByte | NumericKind::UByte | NumericKind::Int32 | NumericKind::Int64
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NumericKind::Bool => "bool",
            NumericKind::SByte => "sbyte",
            NumericKind::UByte => "ubyte",
            NumericKind::Int32 => "int",
            NumericKind::Int64 => "long",
            NumericKind::Float64 => "float",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TypeData {
    Nothing,
    Numeric(NumericKind),
    Array(ArrayType),
    Struct(StructType),
    Invalid,
}

/// One array dimension. Multi-dimensional arrays nest: `int[x, y]` is an
/// array of `x` elements, each an array of `y` ints.
#[derive(Debug, Clone)]
pub struct ArrayType {
    pub element: Box<TypeData>,
    pub size: Option<Box<Expression>>,
}

/// Struct types refer back to their declaring symbol; fields are looked up
/// through the symbol table so forward-declared structs resolve.
#[derive(Debug, Clone)]
pub struct StructType {
    pub name: String,
    pub symbol: SymbolId,
}

impl ArrayType {
    pub fn new(element: TypeData, size: Option<Expression>) -> Self {
        Self {
            element: Box::new(element),
            size: size.map(Box::new),
        }
    }

    /// Builds nested array types from dimensions given outermost first.
    pub fn from_dimensions(base: TypeData, dimensions: Vec<Option<Expression>>) -> TypeData {
        dimensions
            .into_iter()
            .rev()
            .fold(base, |element, size| TypeData::Array(ArrayType::new(element, size)))
    }

    pub fn rank(&self) -> usize {
        match self.element.as_ref() {
            TypeData::Array(inner) => inner.rank() + 1,
            _ => 1,
        }
    }

    pub fn base_element(&self) -> &TypeData {
        match self.element.as_ref() {
            TypeData::Array(inner) => inner.base_element(),
            other => other,
        }
    }

    /// Size expressions, outermost dimension first.
    pub fn dimensions(&self) -> Vec<Option<&Expression>> {
        let mut dimensions = vec![self.size.as_deref()];
        if let TypeData::Array(inner) = self.element.as_ref() {
            dimensions.extend(inner.dimensions());
        }
        dimensions
    }

    pub fn is_sized(&self) -> bool {
        self.dimensions().iter().all(Option::is_some)
    }
}

impl StructType {
    pub fn fields<'a>(&self, table: &'a SymbolTable) -> &'a [SymbolId] {
        table.struct_fields(self.symbol)
    }

    pub fn field(&self, table: &SymbolTable, name: &str) -> Option<(usize, SymbolId)> {
        self.fields(table)
            .iter()
            .enumerate()
            .find(|(_, id)| table.symbol(**id).name == name)
            .map(|(index, id)| (index, *id))
    }
}

impl TypeData {
    pub const BOOL: TypeData = TypeData::Numeric(NumericKind::Bool);
    pub const INT32: TypeData = TypeData::Numeric(NumericKind::Int32);
    pub const INT64: TypeData = TypeData::Numeric(NumericKind::Int64);
    pub const FLOAT64: TypeData = TypeData::Numeric(NumericKind::Float64);

    pub fn as_numeric(&self) -> Option<NumericKind> {
        match self {
            TypeData::Numeric(kind) => Some(*kind),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, TypeData::Numeric(_))
    }

    pub fn is_integral(&self) -> bool {
        self.as_numeric().map_or(false, |k| k.is_integral())
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, TypeData::Numeric(NumericKind::Bool))
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, TypeData::Nothing)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, TypeData::Invalid)
    }

    /// Whether a value of this type needs a fresh allocation before use.
    pub fn is_object_new_needed(&self) -> bool {
        matches!(self, TypeData::Array(_))
    }

    /// Whether an allocated instance may be overwritten in place on later ticks.
    pub fn is_object_reusable(&self, table: &SymbolTable) -> bool {
        match self {
            TypeData::Nothing | TypeData::Numeric(_) | TypeData::Struct(_) => true,
            TypeData::Array(array) => {
                array.element.is_object_reusable(table)
                    && array
                        .size
                        .as_ref()
                        .map_or(false, |size| size.is_constant(table))
            }
            TypeData::Invalid => false,
        }
    }

    pub fn supports_indexing(&self) -> bool {
        matches!(self, TypeData::Array(_))
    }

    pub fn rank(&self) -> usize {
        match self {
            TypeData::Array(array) => array.rank(),
            _ => 0,
        }
    }

    /// Element type after applying `count` indices, if the type has that many dimensions.
    pub fn element_after(&self, count: usize) -> Option<&TypeData> {
        if count == 0 {
            return Some(self);
        }
        match self {
            TypeData::Array(array) => array.element.element_after(count - 1),
            _ => None,
        }
    }

    /// Implicit conversions only ever widen numerics; composite types must match.
    pub fn converts_implicitly_to(&self, target: &TypeData) -> bool {
        match (self, target) {
            (TypeData::Invalid, _) | (_, TypeData::Invalid) => true,
            (TypeData::Numeric(from), TypeData::Numeric(to)) => from <= to,
            _ => self == target,
        }
    }
}

impl PartialEq for TypeData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypeData::Nothing, TypeData::Nothing) => true,
            (TypeData::Invalid, TypeData::Invalid) => true,
            (TypeData::Numeric(a), TypeData::Numeric(b)) => a == b,
            (TypeData::Array(a), TypeData::Array(b)) => a.element == b.element,
            (TypeData::Struct(a), TypeData::Struct(b)) => a.symbol == b.symbol,
            _ => false,
        }
    }
}

impl fmt::Display for TypeData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeData::Nothing => write!(f, "nothing"),
            TypeData::Numeric(kind) => write!(f, "{}", kind.name()),
            TypeData::Array(array) => {
                write!(f, "{}[{}]", array.base_element(), ",".repeat(array.rank() - 1))
            }
            TypeData::Struct(structure) => write!(f, "{}", structure.name),
            TypeData::Invalid => write!(f, "<invalid>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ExprKind, Expression};
    use crate::error::Position;

    fn literal(value: i64) -> Expression {
        Expression::new(
            ExprKind::Integer {
                value,
                kind: NumericKind::Int32,
            },
            Position::new(0, 0),
        )
    }

    #[test]
    fn test_larger_of_is_commutative_and_idempotent() {
        for a in NumericKind::ALL {
            assert_eq!(NumericKind::larger_of(a, a), a);
            for b in NumericKind::ALL {
                assert_eq!(NumericKind::larger_of(a, b), NumericKind::larger_of(b, a));
            }
        }
    }

    #[test]
    fn test_promotion_order() {
        assert!(NumericKind::Int64 > NumericKind::Int32);
        assert!(NumericKind::Float64 > NumericKind::Int64);
        assert!(NumericKind::Bool < NumericKind::SByte);
        assert_eq!(
            NumericKind::larger_of(NumericKind::UByte, NumericKind::SByte),
            NumericKind::UByte
        );
    }

    #[test]
    fn test_nested_dimensions_are_outermost_first() {
        let array = ArrayType::from_dimensions(
            TypeData::INT32,
            vec![Some(literal(10)), Some(literal(20))],
        );
        let TypeData::Array(outer) = &array else {
            panic!("Expected array type");
        };
        assert_eq!(outer.rank(), 2);
        assert_eq!(outer.base_element(), &TypeData::INT32);
        let sizes: Vec<i64> = outer
            .dimensions()
            .into_iter()
            .map(|d| match d.map(|e| &e.kind) {
                Some(ExprKind::Integer { value, .. }) => *value,
                _ => panic!("Expected sized dimension"),
            })
            .collect();
        assert_eq!(sizes, vec![10, 20]);
        assert_eq!(array.to_string(), "int[,]");
        assert!(matches!(array.element_after(1), Some(TypeData::Array(_))));
        assert_eq!(array.element_after(2), Some(&TypeData::INT32));
        assert_eq!(array.element_after(3), None);
    }

    #[test]
    fn test_capabilities() {
        let table = SymbolTable::new();
        let constant = ArrayType::from_dimensions(TypeData::FLOAT64, vec![Some(literal(4))]);
        let open_ended = ArrayType::from_dimensions(TypeData::FLOAT64, vec![None]);

        assert!(constant.is_object_new_needed());
        assert!(constant.is_object_reusable(&table));
        assert!(!open_ended.is_object_reusable(&table));
        assert!(constant.supports_indexing());

        assert!(!TypeData::INT32.is_object_new_needed());
        assert!(TypeData::INT32.is_object_reusable(&table));
        assert!(!TypeData::INT32.supports_indexing());
    }

    #[test]
    fn test_implicit_conversion_only_widens() {
        assert!(TypeData::INT32.converts_implicitly_to(&TypeData::FLOAT64));
        assert!(!TypeData::FLOAT64.converts_implicitly_to(&TypeData::INT32));
        assert!(!TypeData::Nothing.converts_implicitly_to(&TypeData::INT32));
    }
}
