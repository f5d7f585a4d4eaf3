use jvmti_instrument::classfile::{
    decode_line_numbers, ClassFile, ClassFileError, CodeAttribute, ConstantPool, CpInfo, LineNumberEntry,
};

struct CpBuilder {
    entries: Vec<Vec<u8>>,
}

impl CpBuilder {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn push(&mut self, entry: Vec<u8>) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    /// Long and double entries take two slots; the second is never written.
    fn push_wide(&mut self, entry: Vec<u8>) -> u16 {
        let index = self.push(entry);
        self.entries.push(Vec::new());
        index
    }

    fn utf8_raw(&mut self, bytes: &[u8]) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        entry.extend_from_slice(bytes);
        self.push(entry)
    }

    fn utf8(&mut self, s: &str) -> u16 {
        self.utf8_raw(s.as_bytes())
    }

    fn ref1(&mut self, tag: u8, index: u16) -> u16 {
        let mut entry = vec![tag];
        entry.extend_from_slice(&index.to_be_bytes());
        self.push(entry)
    }

    fn ref2(&mut self, tag: u8, a: u16, b: u16) -> u16 {
        let mut entry = vec![tag];
        entry.extend_from_slice(&a.to_be_bytes());
        entry.extend_from_slice(&b.to_be_bytes());
        self.push(entry)
    }

    fn class(&mut self, name_index: u16) -> u16 {
        self.ref1(7, name_index)
    }

    fn string(&mut self, utf8_index: u16) -> u16 {
        self.ref1(8, utf8_index)
    }

    fn name_and_type(&mut self, name_index: u16, descriptor_index: u16) -> u16 {
        self.ref2(12, name_index, descriptor_index)
    }

    fn methodref(&mut self, class_index: u16, name_and_type_index: u16) -> u16 {
        self.ref2(10, class_index, name_and_type_index)
    }

    fn invoke_dynamic(&mut self, bootstrap_index: u16, name_and_type_index: u16) -> u16 {
        self.ref2(18, bootstrap_index, name_and_type_index)
    }

    fn method_handle(&mut self, kind: u8, reference_index: u16) -> u16 {
        let mut entry = vec![15, kind];
        entry.extend_from_slice(&reference_index.to_be_bytes());
        self.push(entry)
    }

    fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry)
    }

    fn float(&mut self, value: f32) -> u16 {
        let mut entry = vec![4];
        entry.extend_from_slice(&value.to_bits().to_be_bytes());
        self.push(entry)
    }

    fn long(&mut self, value: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push_wide(entry)
    }

    fn double(&mut self, value: f64) -> u16 {
        let mut entry = vec![6];
        entry.extend_from_slice(&value.to_bits().to_be_bytes());
        self.push_wide(entry)
    }

    fn module(&mut self, name_index: u16) -> u16 {
        self.ref1(19, name_index)
    }

    fn package(&mut self, name_index: u16) -> u16 {
        self.ref1(20, name_index)
    }
}

fn u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_attr(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    u2(out, name_index);
    u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

/// Indices the assertions need.
struct Fixture {
    bytes: Vec<u8>,
    cp_count: u16,
    init_ref: u16,
    long_index: u16,
    double_index: u16,
    float_index: u16,
    nul_utf8: u16,
    indy: u16,
    module_index: u16,
    package_index: u16,
    class_test: u16,
    class_object: u16,
}

fn build_test_class() -> Fixture {
    let mut cp = CpBuilder::new();

    let utf_test = cp.utf8("Test");
    let utf_object = cp.utf8("java/lang/Object");
    let class_test = cp.class(utf_test);
    let class_object = cp.class(utf_object);

    let utf_init = cp.utf8("<init>");
    let utf_void = cp.utf8("()V");
    let nat_init = cp.name_and_type(utf_init, utf_void);
    let init_ref = cp.methodref(class_object, nat_init);

    let utf_field_name = cp.utf8("value");
    let utf_int_desc = cp.utf8("I");
    let const_int = cp.integer(123);
    let long_index = cp.long(-9_000_000_000);
    let double_index = cp.double(2.5);
    let float_index = cp.float(0.25);
    let nul_utf8 = cp.utf8_raw(&[b'a', 0xC0, 0x80, b'b']);
    let _string = cp.string(nul_utf8);

    let utf_run = cp.utf8("run");
    let utf_runnable_desc = cp.utf8("()Ljava/lang/Runnable;");
    let nat_run = cp.name_and_type(utf_run, utf_runnable_desc);
    let handle = cp.method_handle(6, init_ref);
    let indy = cp.invoke_dynamic(0, nat_run);

    let utf_code = cp.utf8("Code");
    let utf_lnt = cp.utf8("LineNumberTable");
    let utf_smt = cp.utf8("StackMapTable");
    let utf_constant_value = cp.utf8("ConstantValue");
    let utf_source_file = cp.utf8("SourceFile");
    let utf_source_name = cp.utf8("Test.java");
    let utf_inner_classes = cp.utf8("InnerClasses");
    let utf_enclosing = cp.utf8("EnclosingMethod");
    let utf_bootstrap = cp.utf8("BootstrapMethods");
    let utf_unknown = cp.utf8("UnknownAttr");
    let utf_inner = cp.utf8("Test$1");
    let class_inner = cp.class(utf_inner);

    let utf_module_name = cp.utf8("my.module");
    let utf_pkg_name = cp.utf8("my/pkg");
    let module_index = cp.module(utf_module_name);
    let package_index = cp.package(utf_pkg_name);

    let cp_count = (cp.entries.len() + 1) as u16;

    let mut bytes = Vec::new();
    u4(&mut bytes, 0xCAFEBABE);
    u2(&mut bytes, 0);
    u2(&mut bytes, 52);
    u2(&mut bytes, cp_count);
    for entry in cp.entries {
        bytes.extend_from_slice(&entry);
    }

    u2(&mut bytes, 0x0021);
    u2(&mut bytes, class_test);
    u2(&mut bytes, class_object);

    u2(&mut bytes, 0);

    u2(&mut bytes, 1);
    u2(&mut bytes, 0x0001);
    u2(&mut bytes, utf_field_name);
    u2(&mut bytes, utf_int_desc);
    u2(&mut bytes, 1);
    let mut cv_info = Vec::new();
    u2(&mut cv_info, const_int);
    push_attr(&mut bytes, utf_constant_value, &cv_info);

    u2(&mut bytes, 1);
    u2(&mut bytes, 0x0001);
    u2(&mut bytes, utf_init);
    u2(&mut bytes, utf_void);

    // aload_0; invokespecial Object.<init>; return
    let mut code_info = Vec::new();
    u2(&mut code_info, 1);
    u2(&mut code_info, 1);
    u4(&mut code_info, 5);
    u1(&mut code_info, 0x2a);
    u1(&mut code_info, 0xb7);
    u2(&mut code_info, init_ref);
    u1(&mut code_info, 0xb1);
    u2(&mut code_info, 0);

    let mut code_sub_attrs = Vec::new();
    let mut lnt_info = Vec::new();
    u2(&mut lnt_info, 2);
    u2(&mut lnt_info, 0);
    u2(&mut lnt_info, 1);
    u2(&mut lnt_info, 4);
    u2(&mut lnt_info, 2);
    push_attr(&mut code_sub_attrs, utf_lnt, &lnt_info);

    let mut smt_info = Vec::new();
    u2(&mut smt_info, 1);
    u1(&mut smt_info, 4);
    push_attr(&mut code_sub_attrs, utf_smt, &smt_info);

    u2(&mut code_info, 2);
    code_info.extend_from_slice(&code_sub_attrs);

    u2(&mut bytes, 1);
    push_attr(&mut bytes, utf_code, &code_info);

    let mut class_attrs = Vec::new();

    let mut sf_info = Vec::new();
    u2(&mut sf_info, utf_source_name);
    push_attr(&mut class_attrs, utf_source_file, &sf_info);

    let mut inner_info = Vec::new();
    u2(&mut inner_info, 1);
    u2(&mut inner_info, class_inner);
    u2(&mut inner_info, 0);
    u2(&mut inner_info, 0);
    u2(&mut inner_info, 0x0010);
    push_attr(&mut class_attrs, utf_inner_classes, &inner_info);

    let mut enclosing_info = Vec::new();
    u2(&mut enclosing_info, class_object);
    u2(&mut enclosing_info, nat_init);
    push_attr(&mut class_attrs, utf_enclosing, &enclosing_info);

    let mut bootstrap_info = Vec::new();
    u2(&mut bootstrap_info, 1);
    u2(&mut bootstrap_info, handle);
    u2(&mut bootstrap_info, 0);
    push_attr(&mut class_attrs, utf_bootstrap, &bootstrap_info);

    push_attr(&mut class_attrs, utf_unknown, b"data");

    u2(&mut bytes, 5);
    bytes.extend_from_slice(&class_attrs);

    Fixture {
        bytes,
        cp_count,
        init_ref,
        long_index,
        double_index,
        float_index,
        nul_utf8,
        indy,
        module_index,
        package_index,
        class_test,
        class_object,
    }
}

#[test]
fn writes_back_identical_bytes() {
    let fixture = build_test_class();
    let classfile = ClassFile::parse(&fixture.bytes).expect("parse class file");
    assert_eq!(classfile.constant_pool.count(), fixture.cp_count as usize);
    assert_eq!(classfile.to_bytes().unwrap(), fixture.bytes);
}

#[test]
fn resolves_constant_pool_entries() {
    let f = build_test_class();
    let classfile = ClassFile::parse(&f.bytes).unwrap();
    let cp = &classfile.constant_pool;

    assert_eq!(classfile.this_class_name().unwrap(), "Test");
    assert_eq!(classfile.super_class_name().unwrap(), Some("java/lang/Object"));
    assert_eq!(cp.class_name(f.class_test).unwrap(), "Test");
    assert_eq!(cp.member_ref(f.init_ref).unwrap(), ("java/lang/Object", "<init>", "()V"));

    assert_eq!(cp.get(f.long_index).unwrap(), &CpInfo::Long(-9_000_000_000));
    assert_eq!(cp.get(f.long_index + 1), Err(ClassFileError::InvalidConstantPoolIndex(f.long_index + 1)));
    assert_eq!(cp.get(f.double_index).unwrap(), &CpInfo::Double(2.5));
    assert_eq!(cp.get(f.float_index).unwrap(), &CpInfo::Float(0.25));
    assert_eq!(cp.get_utf8(f.nul_utf8).unwrap(), "a\u{0}b");
    assert!(matches!(cp.get(f.indy).unwrap(), CpInfo::InvokeDynamic { bootstrap_method_attr_index: 0, .. }));
    assert!(matches!(cp.get(f.module_index).unwrap(), CpInfo::Module { .. }));
    assert!(matches!(cp.get(f.package_index).unwrap(), CpInfo::Package { .. }));

    assert_eq!(cp.get(0), Err(ClassFileError::InvalidConstantPoolIndex(0)));
    assert!(cp.get_utf8(f.class_object).is_err());
}

#[test]
fn decodes_nesting_attributes() {
    let f = build_test_class();
    let classfile = ClassFile::parse(&f.bytes).unwrap();
    let cp = &classfile.constant_pool;

    let inner = classfile.inner_classes().unwrap();
    assert_eq!(inner.len(), 1);
    assert_eq!(cp.class_name(inner[0].inner_class_info_index).unwrap(), "Test$1");
    assert_eq!(inner[0].outer_class_info_index, 0);

    let enclosing = classfile.enclosing_method().unwrap().expect("EnclosingMethod");
    assert_eq!(enclosing.class_index, f.class_object);
    assert_eq!(cp.name_and_type(enclosing.method_index).unwrap(), ("<init>", "()V"));
}

#[test]
fn decodes_code_attribute() {
    let f = build_test_class();
    let classfile = ClassFile::parse(&f.bytes).unwrap();
    let method = &classfile.methods[0];
    let attr = classfile.find_attribute(&method.attributes, "Code").expect("code attr");
    let code = CodeAttribute::decode(&attr.info).unwrap();

    assert_eq!((code.max_stack, code.max_locals), (1, 1));
    assert_eq!(code.code, vec![0x2a, 0xb7, (f.init_ref >> 8) as u8, f.init_ref as u8, 0xb1]);
    assert!(code.exception_table.is_empty());
    let lnt = classfile.find_attribute(&code.attributes, "LineNumberTable").unwrap();
    assert_eq!(
        decode_line_numbers(&lnt.info).unwrap(),
        vec![LineNumberEntry { start_pc: 0, line_number: 1 }, LineNumberEntry { start_pc: 4, line_number: 2 }]
    );
    assert!(classfile.find_attribute(&code.attributes, "StackMapTable").is_some());
    assert_eq!(code.encode().unwrap(), attr.info);

    let empty = CodeAttribute { code: Vec::new(), ..code };
    assert!(empty.encode().is_err());
}

#[test]
fn rejects_malformed_input() {
    let f = build_test_class();

    let mut bad_magic = f.bytes.clone();
    bad_magic[0] = 0xCB;
    assert_eq!(ClassFile::parse(&bad_magic).unwrap_err(), ClassFileError::InvalidMagic(0xCBFEBABE));

    assert_eq!(ClassFile::parse(&f.bytes[..f.bytes.len() - 1]).unwrap_err(), ClassFileError::UnexpectedEof);
    assert_eq!(ClassFile::parse(&f.bytes[..9]).unwrap_err(), ClassFileError::UnexpectedEof);

    // First constant pool tag follows magic, versions and count.
    let mut bad_tag = f.bytes.clone();
    bad_tag[10] = 2;
    assert_eq!(ClassFile::parse(&bad_tag).unwrap_err(), ClassFileError::InvalidConstantPoolTag(2));

    let mut trailing = f.bytes.clone();
    trailing.push(0);
    assert_eq!(
        ClassFile::parse(&trailing).unwrap_err(),
        ClassFileError::InvalidAttribute("trailing bytes".to_string())
    );
}

#[test]
fn interning_reuses_entries_and_skips_wide_slots() {
    let mut cp = ConstantPool::new();
    let object = cp.class("java/lang/Object").unwrap();
    assert_eq!(cp.class("java/lang/Object").unwrap(), object);

    let long = cp.intern(CpInfo::Long(7)).unwrap();
    let next = cp.utf8("after").unwrap();
    assert_eq!(next, long + 2);
    assert_eq!(cp.count(), next as usize + 1);

    let m = cp.method_ref("java/lang/Object", "hashCode", "()I").unwrap();
    let i = cp.interface_method_ref("java/lang/Runnable", "run", "()V").unwrap();
    assert_eq!(cp.member_ref(m).unwrap(), ("java/lang/Object", "hashCode", "()I"));
    assert!(matches!(cp.get(i).unwrap(), CpInfo::InterfaceMethodref { .. }));
}
