#[derive(Clone, Debug, Default)]
pub struct DumpField {
    pub key: &'static str,
    pub value: String,
}

impl DumpField {
    pub fn new(key: &'static str, value: String) -> DumpField {
        return DumpField { key, value };
    }
}

/// Printable tree of labelled fields, raw lines (code listings) and nested
/// children, rendered with a configurable indent.
#[derive(Clone, Debug, Default)]
pub struct Dump {
    label: String,
    fields: Vec<DumpField>,
    lines: Vec<String>,
    children: Vec<Dump>,
}

impl Dump {
    pub fn new(label: &str) -> Dump {
        let mut dump = Dump::default();
        dump.label = String::from(label);
        return dump;
    }

    pub fn push_field(&mut self, key: &'static str, value: String) {
        self.fields.push(DumpField::new(key, value));
    }

    pub fn push_line(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn push_child(&mut self, dump: Dump) {
        self.children.push(dump);
    }

    pub fn fields_align(&self) -> usize {
        return self
            .fields
            .iter()
            .map(|field| field.key.len())
            .max()
            .unwrap_or(0)
            + 1;
    }

    #[rustfmt::skip]
    pub fn print(&self, indent_level: usize, indent_size: usize) {
        let indent = indent_level * indent_size;

        println!("{:>width$}{}", "", self.label, width = indent);

        let fields_indent = (indent_level + 1) * indent_size;
        let fields_align = self.fields_align();

        for field in self.fields.iter() {
            println!(
                "{:>width$}{label:<align$}: {}",
                "",
                field.value,
                width = fields_indent,
                label = field.key,
                align = fields_align);
        }

        for line in self.lines.iter() {
            println!("{:>width$}{}", "", line, width = fields_indent);
        }

        for child in self.children.iter() {
            child.print(indent_level + 1, indent_size);
        }
    }
}
