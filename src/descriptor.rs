//! Java type names, JVM descriptors and the conversions between them.

use std::fmt;

use crate::classfile::{ClassFileError, ConstantPool, VerificationTypeInfo};

/// `a.b.C` to `a/b/C`.
pub fn java_name_to_internal(name: &str) -> String {
    name.replace('.', "/")
}

/// `a/b/C` to `a.b.C`.
pub fn internal_to_java_name(name: &str) -> String {
    name.replace('/', ".")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JavaType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    /// Internal name of a class or interface.
    Object(String),
    Array(Box<JavaType>),
}

impl JavaType {
    pub fn object(internal_name: &str) -> JavaType {
        JavaType::Object(internal_name.to_string())
    }

    /// Parses a source-level name such as `int`, `java.lang.String` or `byte[][]`.
    pub fn from_java_name(name: &str) -> Result<JavaType, ClassFileError> {
        let name = name.trim();
        if let Some(element) = name.strip_suffix("[]") {
            return Ok(JavaType::Array(Box::new(JavaType::from_java_name(element)?)));
        }
        let ty = match name {
            "boolean" => JavaType::Boolean,
            "byte" => JavaType::Byte,
            "char" => JavaType::Char,
            "short" => JavaType::Short,
            "int" => JavaType::Int,
            "long" => JavaType::Long,
            "float" => JavaType::Float,
            "double" => JavaType::Double,
            "void" => JavaType::Void,
            "" => return Err(ClassFileError::InvalidDescriptor(name.to_string())),
            other => JavaType::Object(java_name_to_internal(other)),
        };
        Ok(ty)
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::new();
        self.write_descriptor(&mut out);
        out
    }

    fn write_descriptor(&self, out: &mut String) {
        match self {
            JavaType::Boolean => out.push('Z'),
            JavaType::Byte => out.push('B'),
            JavaType::Char => out.push('C'),
            JavaType::Short => out.push('S'),
            JavaType::Int => out.push('I'),
            JavaType::Long => out.push('J'),
            JavaType::Float => out.push('F'),
            JavaType::Double => out.push('D'),
            JavaType::Void => out.push('V'),
            JavaType::Object(name) => {
                out.push('L');
                out.push_str(name);
                out.push(';');
            }
            JavaType::Array(element) => {
                out.push('[');
                element.write_descriptor(out);
            }
        }
    }

    /// Source-level name, as a plugin would write it.
    pub fn java_name(&self) -> String {
        match self {
            JavaType::Boolean => "boolean".to_string(),
            JavaType::Byte => "byte".to_string(),
            JavaType::Char => "char".to_string(),
            JavaType::Short => "short".to_string(),
            JavaType::Int => "int".to_string(),
            JavaType::Long => "long".to_string(),
            JavaType::Float => "float".to_string(),
            JavaType::Double => "double".to_string(),
            JavaType::Void => "void".to_string(),
            JavaType::Object(name) => internal_to_java_name(name),
            JavaType::Array(element) => format!("{}[]", element.java_name()),
        }
    }

    /// Number of local variable or operand stack slots a value occupies.
    pub fn slots(&self) -> u16 {
        match self {
            JavaType::Void => 0,
            JavaType::Long | JavaType::Double => 2,
            _ => 1,
        }
    }

    /// Wrapper class used when boxing a primitive.
    pub fn box_class(&self) -> Option<&'static str> {
        let class = match self {
            JavaType::Boolean => "java/lang/Boolean",
            JavaType::Byte => "java/lang/Byte",
            JavaType::Char => "java/lang/Character",
            JavaType::Short => "java/lang/Short",
            JavaType::Int => "java/lang/Integer",
            JavaType::Long => "java/lang/Long",
            JavaType::Float => "java/lang/Float",
            JavaType::Double => "java/lang/Double",
            _ => return None,
        };
        Some(class)
    }

    /// Name usable in a `CONSTANT_Class` entry: internal name for classes,
    /// descriptor for arrays.
    pub fn class_constant_name(&self) -> Option<String> {
        match self {
            JavaType::Object(name) => Some(name.clone()),
            JavaType::Array(_) => Some(self.descriptor()),
            _ => None,
        }
    }

    pub fn verification_type(&self, cp: &mut ConstantPool) -> Result<Vec<VerificationTypeInfo>, ClassFileError> {
        let info = match self {
            JavaType::Boolean | JavaType::Byte | JavaType::Char | JavaType::Short | JavaType::Int => {
                VerificationTypeInfo::Integer
            }
            JavaType::Float => VerificationTypeInfo::Float,
            JavaType::Long => VerificationTypeInfo::Long,
            JavaType::Double => VerificationTypeInfo::Double,
            JavaType::Void => return Ok(Vec::new()),
            JavaType::Object(_) | JavaType::Array(_) => {
                let name = self.class_constant_name().unwrap_or_default();
                VerificationTypeInfo::Object(cp.class(&name)?)
            }
        };
        Ok(vec![info])
    }
}

impl fmt::Display for JavaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.java_name())
    }
}

type Chars<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn parse_type(descriptor: &str, chars: &mut Chars<'_>) -> Result<JavaType, ClassFileError> {
    let invalid = || ClassFileError::InvalidDescriptor(descriptor.to_string());
    let (start, c) = chars.next().ok_or_else(invalid)?;
    let ty = match c {
        'Z' => JavaType::Boolean,
        'B' => JavaType::Byte,
        'C' => JavaType::Char,
        'S' => JavaType::Short,
        'I' => JavaType::Int,
        'J' => JavaType::Long,
        'F' => JavaType::Float,
        'D' => JavaType::Double,
        'V' => JavaType::Void,
        '[' => JavaType::Array(Box::new(parse_type(descriptor, chars)?)),
        'L' => {
            let name_start = start + 1;
            loop {
                match chars.next() {
                    Some((end, ';')) if end > name_start => {
                        break JavaType::Object(descriptor[name_start..end].to_string());
                    }
                    Some((_, ';')) | None => return Err(invalid()),
                    Some(_) => {}
                }
            }
        }
        _ => return Err(invalid()),
    };
    Ok(ty)
}

/// Parameter and return types of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodType {
    pub params: Vec<JavaType>,
    pub ret: JavaType,
}

impl MethodType {
    pub fn new(params: Vec<JavaType>, ret: JavaType) -> Self {
        Self { params, ret }
    }

    pub fn parse(descriptor: &str) -> Result<MethodType, ClassFileError> {
        let invalid = || ClassFileError::InvalidDescriptor(descriptor.to_string());
        let mut chars = descriptor.char_indices().peekable();
        if chars.next().map(|(_, c)| c) != Some('(') {
            return Err(invalid());
        }
        let mut params = Vec::new();
        loop {
            match chars.peek() {
                Some((_, ')')) => {
                    chars.next();
                    break;
                }
                Some(_) => {
                    let p = parse_type(descriptor, &mut chars)?;
                    if p == JavaType::Void {
                        return Err(invalid());
                    }
                    params.push(p);
                }
                None => return Err(invalid()),
            }
        }
        let ret = parse_type(descriptor, &mut chars)?;
        if chars.next().is_some() {
            return Err(invalid());
        }
        Ok(MethodType { params, ret })
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::from("(");
        for p in &self.params {
            p.write_descriptor(&mut out);
        }
        out.push(')');
        self.ret.write_descriptor(&mut out);
        out
    }

    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(JavaType::slots).sum()
    }
}

/// Parameter list rendered for humans, e.g. `(int, java.lang.String)`.
pub fn parameter_description(params: &[JavaType]) -> String {
    let names: Vec<String> = params.iter().map(JavaType::java_name).collect();
    format!("({})", names.join(", "))
}

/// Converts the parameter names a plugin passes to lookups.
pub fn parse_java_names(names: &[&str]) -> Result<Vec<JavaType>, ClassFileError> {
    names.iter().map(|n| JavaType::from_java_name(n)).collect()
}
