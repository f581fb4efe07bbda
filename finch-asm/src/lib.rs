//! Two-pass assembler for the finch instruction set
//!
//! The first pass walks the token stream to size every statement, recording
//! label addresses and `.equ` constants; the second pass re-walks the source
//! and emits machine code, deferring forward label references to a fixup
//! list that is patched once all labels are known.  Opcode numbers and
//! instruction sizes come straight from [`finch_vm::op`], so the encoder
//! cannot drift from the decoder.
//!
//! ```
//! let image = finch_asm::assemble("MOVI R0, 0x4000\nHALT\n").unwrap();
//! assert_eq!(image, [0x11, 0x00, 0x00, 0x40, 0x01]);
//! ```

use std::collections::HashMap;
use std::fmt;

use finch_vm::op;

mod lexer;
use lexer::{Lexer, Spanned, Token};

/// What went wrong, independent of the message text
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Unknown instruction mnemonic
    InvalidMnemonic,
    /// Operand was not one of `R0`..`R7`
    InvalidRegister,
    /// Operand has the wrong shape for the instruction
    InvalidOperand,
    /// Token out of place in the statement grammar
    UnexpectedToken,
    /// Reference to a label that is never defined
    UndefinedLabel,
    /// Label (or constant) defined twice
    DuplicateLabel,
    /// Literal or resolved value outside the operand's range
    NumberOutOfRange,
    /// Unknown `.directive`
    InvalidDirective,
    /// String or character literal runs off the end of the line
    UnterminatedString,
}

/// An assembly diagnostic with its source position
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    /// 1-based source line
    pub line: u32,
    /// 1-based column
    pub col: u32,
    pub message: String,
}

impl Error {
    fn new(kind: ErrorKind, line: u32, col: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            col,
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for Error {}

/// Assembles `source` into a flat binary image
///
/// On failure, returns every diagnostic collected before assembly had to
/// stop; no partial output is ever produced.
pub fn assemble(source: &str) -> Result<Vec<u8>, Vec<Error>> {
    Assembler::new(source).run()
}

/// Operand shape of an instruction, driving both parsing and encoding
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operands {
    /// No operands, opcode byte only
    Implied,
    /// One register, encoded in the Rs slot
    SrcReg,
    /// One register, encoded in the Rd slot
    DstReg,
    /// `Rd, Rs`
    DstSrc,
    /// `Rd, imm16`
    DstImm16,
    /// `Rd, imm8` (zero-extended by the CPU)
    DstImm8,
    /// `Rd, 0..7`; the distance lives in the Rs slot
    DstShift,
    /// `Rd, [Rs]`
    DstInd,
    /// `[Rd], Rs`
    IndSrc,
    /// 16-bit address, no register byte
    Target,
}

/// Case-folded mnemonic lookup, including the branch aliases
fn lookup(upper: &str) -> Option<(u8, Operands)> {
    use Operands::*;
    Some(match upper {
        "NOP" => (op::NOP, Implied),
        "HALT" => (op::HALT, Implied),
        "DISPLAY" => (op::DISPLAY, Implied),
        "RET" => (op::RET, Implied),
        "PUSHF" => (op::PUSHF, Implied),
        "POPF" => (op::POPF, Implied),
        "MEMCPY" => (op::MEMCPY, Implied),
        "MEMSET" => (op::MEMSET, Implied),

        "PUTC" => (op::PUTC, SrcReg),
        "PUTS" => (op::PUTS, SrcReg),
        "PUTI" => (op::PUTI, SrcReg),
        "PUTX" => (op::PUTX, SrcReg),
        "PUSH" => (op::PUSH, SrcReg),
        "JMPR" => (op::JMPR, SrcReg),
        "CALLR" => (op::CALLR, SrcReg),

        "POP" => (op::POP, DstReg),
        "INC" => (op::INC, DstReg),
        "DEC" => (op::DEC, DstReg),
        "NEG" => (op::NEG, DstReg),
        "NOT" => (op::NOT, DstReg),

        "MOV" => (op::MOV, DstSrc),
        "ADD" => (op::ADD, DstSrc),
        "SUB" => (op::SUB, DstSrc),
        "MUL" => (op::MUL, DstSrc),
        "DIV" => (op::DIV, DstSrc),
        "AND" => (op::AND, DstSrc),
        "OR" => (op::OR, DstSrc),
        "XOR" => (op::XOR, DstSrc),
        "SHL" => (op::SHL, DstSrc),
        "SHR" => (op::SHR, DstSrc),
        "SAR" => (op::SAR, DstSrc),
        "CMP" => (op::CMP, DstSrc),
        "TEST" => (op::TEST, DstSrc),

        "MOVI" => (op::MOVI, DstImm16),

        "ADDI" => (op::ADDI, DstImm8),
        "SUBI" => (op::SUBI, DstImm8),
        "ANDI" => (op::ANDI, DstImm8),
        "ORI" => (op::ORI, DstImm8),
        "XORI" => (op::XORI, DstImm8),
        "CMPI" => (op::CMPI, DstImm8),
        "TESTI" => (op::TESTI, DstImm8),

        "SHLI" => (op::SHLI, DstShift),
        "SHRI" => (op::SHRI, DstShift),
        "SARI" => (op::SARI, DstShift),

        "LOAD" => (op::LOAD, DstInd),
        "LOADB" => (op::LOADB, DstInd),

        "STORE" => (op::STORE, IndSrc),
        "STOREB" => (op::STOREB, IndSrc),

        "JMP" => (op::JMP, Target),
        "CALL" => (op::CALL, Target),
        "JZ" | "JE" => (op::JZ, Target),
        "JNZ" | "JNE" => (op::JNZ, Target),
        "JC" | "JB" => (op::JC, Target),
        "JNC" | "JAE" => (op::JNC, Target),
        "JN" | "JS" => (op::JN, Target),
        "JNN" | "JNS" => (op::JNN, Target),
        "JO" => (op::JO, Target),
        "JNO" => (op::JNO, Target),
        "JA" => (op::JA, Target),
        "JBE" => (op::JBE, Target),
        "JG" => (op::JG, Target),
        "JGE" => (op::JGE, Target),
        "JL" => (op::JL, Target),
        "JLE" => (op::JLE, Target),

        _ => return None,
    })
}

/// A deferred address patch for a forward label reference
struct Fixup {
    /// Byte offset in the output buffer where the address goes
    offset: usize,
    label: String,
    line: u32,
    col: u32,
}

/// A resolved or deferred 16-bit operand
enum Imm16 {
    Value(u16),
    Forward(String, u32, u32),
}

struct Assembler<'a> {
    src: &'a str,
    out: Vec<u8>,
    labels: HashMap<String, u16>,
    constants: HashMap<String, i32>,
    fixups: Vec<Fixup>,
    errors: Vec<Error>,
    /// Emission address, tracked during pass 1
    addr: u16,
}

impl<'a> Assembler<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            out: Vec::new(),
            labels: HashMap::new(),
            constants: HashMap::new(),
            fixups: Vec::new(),
            errors: Vec::new(),
            addr: 0,
        }
    }

    fn run(mut self) -> Result<Vec<u8>, Vec<Error>> {
        self.pass1();
        // sizes or label addresses may be wrong after a pass-1 error, so
        // emission only runs on a clean slate
        if self.errors.is_empty() {
            self.pass2();
            self.resolve_fixups();
        }
        if self.errors.is_empty() {
            log::debug!("assembled {} bytes", self.out.len());
            Ok(self.out)
        } else {
            Err(self.errors)
        }
    }

    /// Consumes tokens up to and including the next newline
    ///
    /// Lexical errors inside the skipped text are dropped here; pass 2
    /// parses the same text properly and reports them with full context.
    fn sync(&self, lex: &mut Lexer) {
        loop {
            match lex.next() {
                Ok(t) if t.tok == Token::Newline => break,
                Ok(t) if t.tok == Token::Eof => {
                    lex.push_back(t);
                    break;
                }
                Ok(_) | Err(_) => (),
            }
        }
    }

    fn err(&mut self, e: Error, lex: &mut Lexer) {
        self.errors.push(e);
        self.sync(lex);
    }

    // ------------------------------------------------------------------
    // Pass 1: sizing
    // ------------------------------------------------------------------

    fn pass1(&mut self) {
        let mut lex = Lexer::new(self.src);
        self.addr = 0;
        loop {
            let t = match lex.next() {
                Ok(t) => t,
                Err(e) => {
                    self.err(e, &mut lex);
                    continue;
                }
            };
            match t.tok {
                Token::Eof => break,
                Token::Newline => continue,
                Token::Dot => {
                    if let Err(e) = self.directive_pass1(&mut lex) {
                        self.err(e, &mut lex);
                    }
                }
                Token::Ident(name) => {
                    if let Err(e) = self.ident_pass1(&mut lex, name, t.line, t.col) {
                        self.err(e, &mut lex);
                    }
                }
                _ => {
                    let e = Error::new(
                        ErrorKind::UnexpectedToken,
                        t.line,
                        t.col,
                        format!("expected label, directive or mnemonic, found {:?}", t.tok),
                    );
                    self.err(e, &mut lex);
                }
            }
        }
    }

    fn ident_pass1(
        &mut self,
        lex: &mut Lexer,
        name: String,
        line: u32,
        col: u32,
    ) -> Result<(), Error> {
        let next = lex.next()?;
        if next.tok == Token::Colon {
            if self.labels.contains_key(&name) {
                return Err(Error::new(
                    ErrorKind::DuplicateLabel,
                    line,
                    col,
                    format!("duplicate label `{name}`"),
                ));
            }
            self.labels.insert(name, self.addr);
            return Ok(());
        }
        lex.push_back(next);

        let upper = name.to_ascii_uppercase();
        match lookup(&upper) {
            Some((opcode, _)) => {
                self.addr = self.addr.wrapping_add(op::size(opcode));
                // operands are validated during emission
                self.sync(lex);
                Ok(())
            }
            None => Err(Error::new(
                ErrorKind::InvalidMnemonic,
                line,
                col,
                format!("unknown mnemonic `{name}`"),
            )),
        }
    }

    fn directive_pass1(&mut self, lex: &mut Lexer) -> Result<(), Error> {
        let (name, line, col) = self.directive_name(lex)?;
        match name.as_str() {
            "ORG" => {
                let v = self.address_literal(lex)?;
                self.addr = v;
                self.end_of_statement(lex)
            }
            "EQU" => {
                let t = lex.next()?;
                let Token::Ident(cname) = t.tok else {
                    return Err(Error::new(
                        ErrorKind::UnexpectedToken,
                        t.line,
                        t.col,
                        "expected constant name after .equ",
                    ));
                };
                self.expect(lex, Token::Comma)?;
                let v = self.const_value(lex)?;
                if self.constants.contains_key(&cname) {
                    return Err(Error::new(
                        ErrorKind::DuplicateLabel,
                        t.line,
                        t.col,
                        format!("constant `{cname}` redefined"),
                    ));
                }
                self.constants.insert(cname, v);
                self.end_of_statement(lex)
            }
            "DB" => {
                let n = self.data_items_len(lex, 1)?;
                self.addr = self.addr.wrapping_add(n);
                Ok(())
            }
            "DW" => {
                let n = self.data_items_len(lex, 2)?;
                self.addr = self.addr.wrapping_add(n);
                Ok(())
            }
            "DS" => {
                let v = self.address_literal(lex)?;
                self.addr = self.addr.wrapping_add(v);
                self.end_of_statement(lex)
            }
            _ => Err(Error::new(
                ErrorKind::InvalidDirective,
                line,
                col,
                format!("unknown directive `.{}`", name.to_ascii_lowercase()),
            )),
        }
    }

    /// Sizes a `.db`/`.dw` item list without emitting anything
    fn data_items_len(&mut self, lex: &mut Lexer, item_size: u16) -> Result<u16, Error> {
        let mut total: u16 = 0;
        loop {
            let t = lex.next()?;
            match t.tok {
                Token::Str(s) => {
                    // strings only make sense in .db; .dw rejects them later
                    total = total.wrapping_add(s.len() as u16);
                }
                Token::Number(_) | Token::Char(_) | Token::Ident(_) => {
                    total = total.wrapping_add(item_size);
                }
                Token::Minus => {
                    // sign of a numeric item; the number follows
                    continue;
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedToken,
                        t.line,
                        t.col,
                        format!("unexpected {:?} in data list", t.tok),
                    ));
                }
            }
            let sep = lex.next()?;
            match sep.tok {
                Token::Comma => continue,
                Token::Newline => break,
                Token::Eof => {
                    lex.push_back(sep);
                    break;
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedToken,
                        sep.line,
                        sep.col,
                        format!("expected `,` or end of line, found {:?}", sep.tok),
                    ));
                }
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Pass 2: emission
    // ------------------------------------------------------------------

    fn pass2(&mut self) {
        let mut lex = Lexer::new(self.src);
        loop {
            let t = match lex.next() {
                Ok(t) => t,
                Err(e) => {
                    self.err(e, &mut lex);
                    continue;
                }
            };
            match t.tok {
                Token::Eof => break,
                Token::Newline => continue,
                Token::Dot => {
                    if let Err(e) = self.directive_pass2(&mut lex) {
                        self.err(e, &mut lex);
                    }
                }
                Token::Ident(name) => {
                    if let Err(e) = self.ident_pass2(&mut lex, name, t.line, t.col) {
                        self.err(e, &mut lex);
                    }
                }
                // pass 1 already complained about anything else
                _ => self.sync(&mut lex),
            }
        }
    }

    fn ident_pass2(
        &mut self,
        lex: &mut Lexer,
        name: String,
        line: u32,
        col: u32,
    ) -> Result<(), Error> {
        let next = lex.next()?;
        if next.tok == Token::Colon {
            return Ok(());
        }
        lex.push_back(next);

        let upper = name.to_ascii_uppercase();
        let Some((opcode, shape)) = lookup(&upper) else {
            // unreachable after a clean pass 1, but harmless to repeat
            return Err(Error::new(
                ErrorKind::InvalidMnemonic,
                line,
                col,
                format!("unknown mnemonic `{name}`"),
            ));
        };

        self.out.push(opcode);
        match shape {
            Operands::Implied => (),
            Operands::SrcReg => {
                let r = self.register(lex)?;
                self.out.push(r << 2);
            }
            Operands::DstReg => {
                let r = self.register(lex)?;
                self.out.push(r << 5);
            }
            Operands::DstSrc => {
                let rd = self.register(lex)?;
                self.expect(lex, Token::Comma)?;
                let rs = self.register(lex)?;
                self.out.push(rd << 5 | rs << 2);
            }
            Operands::DstImm16 => {
                let rd = self.register(lex)?;
                self.expect(lex, Token::Comma)?;
                self.out.push(rd << 5);
                let v = self.imm16(lex)?;
                self.emit_imm16(v);
            }
            Operands::DstImm8 => {
                let rd = self.register(lex)?;
                self.expect(lex, Token::Comma)?;
                self.out.push(rd << 5);
                let v = self.imm8(lex)?;
                self.out.push(v);
            }
            Operands::DstShift => {
                let rd = self.register(lex)?;
                self.expect(lex, Token::Comma)?;
                let n = self.shift_distance(lex)?;
                self.out.push(rd << 5 | n << 2);
            }
            Operands::DstInd => {
                let rd = self.register(lex)?;
                self.expect(lex, Token::Comma)?;
                self.expect(lex, Token::LBracket)?;
                let rs = self.register(lex)?;
                self.expect(lex, Token::RBracket)?;
                self.out.push(rd << 5 | rs << 2);
            }
            Operands::IndSrc => {
                self.expect(lex, Token::LBracket)?;
                let rd = self.register(lex)?;
                self.expect(lex, Token::RBracket)?;
                self.expect(lex, Token::Comma)?;
                let rs = self.register(lex)?;
                self.out.push(rd << 5 | rs << 2);
            }
            Operands::Target => {
                let v = self.imm16(lex)?;
                self.emit_imm16(v);
            }
        }
        self.end_of_statement(lex)
    }

    fn directive_pass2(&mut self, lex: &mut Lexer) -> Result<(), Error> {
        let (name, line, col) = self.directive_name(lex)?;
        match name.as_str() {
            "ORG" => {
                let v = self.address_literal(lex)?;
                let n = usize::from(v);
                if self.out.len() < n {
                    self.out.resize(n, 0);
                }
                self.end_of_statement(lex)
            }
            "EQU" => {
                // recorded in pass 1
                self.sync(lex);
                Ok(())
            }
            "DB" => self.emit_data(lex, false),
            "DW" => self.emit_data(lex, true),
            "DS" => {
                let v = self.address_literal(lex)?;
                let n = self.out.len() + usize::from(v);
                self.out.resize(n, 0);
                self.end_of_statement(lex)
            }
            _ => Err(Error::new(
                ErrorKind::InvalidDirective,
                line,
                col,
                format!("unknown directive `.{}`", name.to_ascii_lowercase()),
            )),
        }
    }

    /// Emits a `.db` (byte) or `.dw` (little-endian word) item list
    fn emit_data(&mut self, lex: &mut Lexer, wide: bool) -> Result<(), Error> {
        loop {
            let t = lex.next()?;
            match t.tok {
                Token::Str(s) if !wide => {
                    self.out.extend_from_slice(&s);
                }
                Token::Char(c) => {
                    if wide {
                        self.emit_imm16(Imm16::Value(u16::from(c)));
                    } else {
                        self.out.push(c);
                    }
                }
                Token::Number(_) | Token::Minus => {
                    let (line, col) = (t.line, t.col);
                    lex.push_back(t);
                    let v = self.number_literal(lex)?;
                    if wide {
                        if !(-32768..=65535).contains(&v) {
                            return Err(Error::new(
                                ErrorKind::NumberOutOfRange,
                                line,
                                col,
                                format!("{v} does not fit in a word"),
                            ));
                        }
                        self.emit_imm16(Imm16::Value(v as u16));
                    } else {
                        if !(-128..=255).contains(&v) {
                            return Err(Error::new(
                                ErrorKind::NumberOutOfRange,
                                line,
                                col,
                                format!("{v} does not fit in a byte"),
                            ));
                        }
                        self.out.push(v as u8);
                    }
                }
                Token::Ident(name) => {
                    // constants first, then labels; .dw may defer to a fixup
                    if let Some(&c) = self.constants.get(&name) {
                        if wide {
                            self.emit_imm16(Imm16::Value(c as u16));
                        } else {
                            self.out.push(c as u8);
                        }
                    } else if let Some(&a) = self.labels.get(&name) {
                        if wide {
                            self.emit_imm16(Imm16::Value(a));
                        } else {
                            self.out.push(a as u8);
                        }
                    } else if wide {
                        self.emit_imm16(Imm16::Forward(name, t.line, t.col));
                    } else {
                        return Err(Error::new(
                            ErrorKind::UndefinedLabel,
                            t.line,
                            t.col,
                            format!("undefined symbol `{name}`"),
                        ));
                    }
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedToken,
                        t.line,
                        t.col,
                        format!("unexpected {:?} in data list", t.tok),
                    ));
                }
            }
            let sep = lex.next()?;
            match sep.tok {
                Token::Comma => continue,
                Token::Newline => return Ok(()),
                Token::Eof => {
                    lex.push_back(sep);
                    return Ok(());
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedToken,
                        sep.line,
                        sep.col,
                        format!("expected `,` or end of line, found {:?}", sep.tok),
                    ));
                }
            }
        }
    }

    fn resolve_fixups(&mut self) {
        for f in &self.fixups {
            match self.labels.get(&f.label) {
                Some(&addr) => {
                    let [lo, hi] = addr.to_le_bytes();
                    self.out[f.offset] = lo;
                    self.out[f.offset + 1] = hi;
                }
                None => self.errors.push(Error::new(
                    ErrorKind::UndefinedLabel,
                    f.line,
                    f.col,
                    format!("undefined label `{}`", f.label),
                )),
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared operand parsing
    // ------------------------------------------------------------------

    /// Reads the identifier after the `.` that opens a directive
    fn directive_name(&mut self, lex: &mut Lexer) -> Result<(String, u32, u32), Error> {
        let t = lex.next()?;
        match t.tok {
            Token::Ident(name) => Ok((name.to_ascii_uppercase(), t.line, t.col)),
            _ => Err(Error::new(
                ErrorKind::InvalidDirective,
                t.line,
                t.col,
                "expected directive name after `.`",
            )),
        }
    }

    fn expect(&mut self, lex: &mut Lexer, want: Token) -> Result<Spanned, Error> {
        let t = lex.next()?;
        if t.tok == want {
            Ok(t)
        } else {
            Err(Error::new(
                ErrorKind::UnexpectedToken,
                t.line,
                t.col,
                format!("expected {:?}, found {:?}", want, t.tok),
            ))
        }
    }

    /// Requires the statement to end here (newline or end of input)
    fn end_of_statement(&mut self, lex: &mut Lexer) -> Result<(), Error> {
        let t = lex.next()?;
        match t.tok {
            Token::Newline => Ok(()),
            Token::Eof => {
                lex.push_back(t);
                Ok(())
            }
            _ => Err(Error::new(
                ErrorKind::UnexpectedToken,
                t.line,
                t.col,
                format!("trailing {:?} after statement", t.tok),
            )),
        }
    }

    /// Parses `R0`..`R7`, case-insensitive
    fn register(&mut self, lex: &mut Lexer) -> Result<u8, Error> {
        let t = lex.next()?;
        if let Token::Ident(name) = &t.tok {
            let b = name.as_bytes();
            if b.len() == 2
                && (b[0] == b'r' || b[0] == b'R')
                && b[1].is_ascii_digit()
            {
                let n = b[1] - b'0';
                if n < 8 {
                    return Ok(n);
                }
            }
        }
        Err(Error::new(
            ErrorKind::InvalidRegister,
            t.line,
            t.col,
            format!("expected register R0..R7, found {:?}", t.tok),
        ))
    }

    /// Parses a signed numeric literal (optional unary minus)
    fn number_literal(&mut self, lex: &mut Lexer) -> Result<i64, Error> {
        let t = lex.next()?;
        match t.tok {
            Token::Minus => {
                let n = lex.next()?;
                match n.tok {
                    Token::Number(v) => Ok(-v),
                    _ => Err(Error::new(
                        ErrorKind::UnexpectedToken,
                        n.line,
                        n.col,
                        "expected number after `-`",
                    )),
                }
            }
            Token::Number(v) => Ok(v),
            _ => Err(Error::new(
                ErrorKind::InvalidOperand,
                t.line,
                t.col,
                format!("expected number, found {:?}", t.tok),
            )),
        }
    }

    /// Parses a plain non-negative literal fitting in 16 bits (`.org`, `.ds`)
    fn address_literal(&mut self, lex: &mut Lexer) -> Result<u16, Error> {
        let t = lex.next()?;
        let (line, col) = (t.line, t.col);
        lex.push_back(t);
        let v = self.number_literal(lex)?;
        if (0..=0xFFFF).contains(&v) {
            Ok(v as u16)
        } else {
            Err(Error::new(
                ErrorKind::NumberOutOfRange,
                line,
                col,
                format!("{v} does not fit in an address"),
            ))
        }
    }

    /// Parses the `.equ` value: a 32-bit signed integer or char literal
    fn const_value(&mut self, lex: &mut Lexer) -> Result<i32, Error> {
        let t = lex.next()?;
        if let Token::Char(c) = t.tok {
            return Ok(i32::from(c));
        }
        let (line, col) = (t.line, t.col);
        lex.push_back(t);
        let v = self.number_literal(lex)?;
        i32::try_from(v).map_err(|_| {
            Error::new(
                ErrorKind::NumberOutOfRange,
                line,
                col,
                format!("{v} does not fit in 32 bits"),
            )
        })
    }

    /// Parses a 16-bit immediate: number, char, constant, or label
    ///
    /// An identifier that is neither a constant nor a known label becomes a
    /// forward reference to be fixed up after pass 2.
    fn imm16(&mut self, lex: &mut Lexer) -> Result<Imm16, Error> {
        let t = lex.next()?;
        match t.tok {
            Token::Char(c) => Ok(Imm16::Value(u16::from(c))),
            Token::Ident(name) => {
                if let Some(&c) = self.constants.get(&name) {
                    // constants are truncated where emitted
                    Ok(Imm16::Value(c as u16))
                } else if let Some(&a) = self.labels.get(&name) {
                    Ok(Imm16::Value(a))
                } else {
                    Ok(Imm16::Forward(name, t.line, t.col))
                }
            }
            Token::Number(_) | Token::Minus => {
                let (line, col) = (t.line, t.col);
                lex.push_back(t);
                let v = self.number_literal(lex)?;
                if (-32768..=65535).contains(&v) {
                    Ok(Imm16::Value(v as u16))
                } else {
                    Err(Error::new(
                        ErrorKind::NumberOutOfRange,
                        line,
                        col,
                        format!("{v} does not fit in 16 bits"),
                    ))
                }
            }
            _ => Err(Error::new(
                ErrorKind::InvalidOperand,
                t.line,
                t.col,
                format!("expected immediate, found {:?}", t.tok),
            )),
        }
    }

    fn emit_imm16(&mut self, v: Imm16) {
        match v {
            Imm16::Value(v) => {
                let [lo, hi] = v.to_le_bytes();
                self.out.push(lo);
                self.out.push(hi);
            }
            Imm16::Forward(label, line, col) => {
                self.fixups.push(Fixup {
                    offset: self.out.len(),
                    label,
                    line,
                    col,
                });
                self.out.push(0);
                self.out.push(0);
            }
        }
    }

    /// Parses an 8-bit immediate; the resolved value must fit −128..255
    fn imm8(&mut self, lex: &mut Lexer) -> Result<u8, Error> {
        let t = lex.next()?;
        let (line, col) = (t.line, t.col);
        let v: i64 = match t.tok {
            Token::Char(c) => i64::from(c),
            Token::Ident(name) => {
                if let Some(&c) = self.constants.get(&name) {
                    i64::from(c)
                } else if let Some(&a) = self.labels.get(&name) {
                    i64::from(a)
                } else {
                    return Err(Error::new(
                        ErrorKind::UndefinedLabel,
                        line,
                        col,
                        format!("undefined symbol `{name}` in byte operand"),
                    ));
                }
            }
            Token::Number(_) | Token::Minus => {
                lex.push_back(t);
                self.number_literal(lex)?
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidOperand,
                    line,
                    col,
                    format!("expected immediate, found {:?}", t.tok),
                ))
            }
        };
        if (-128..=255).contains(&v) {
            Ok(v as u8)
        } else {
            Err(Error::new(
                ErrorKind::NumberOutOfRange,
                line,
                col,
                format!("{v} does not fit in a byte operand"),
            ))
        }
    }

    /// Parses a shift distance; it must fit the 3-bit Rs field (0..7)
    fn shift_distance(&mut self, lex: &mut Lexer) -> Result<u8, Error> {
        let t = lex.next()?;
        let (line, col) = (t.line, t.col);
        let v: i64 = match t.tok {
            Token::Number(v) => v,
            Token::Ident(name) => match self.constants.get(&name) {
                Some(&c) => i64::from(c),
                None => {
                    return Err(Error::new(
                        ErrorKind::UndefinedLabel,
                        line,
                        col,
                        format!("undefined constant `{name}` in shift distance"),
                    ))
                }
            },
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidOperand,
                    line,
                    col,
                    format!("expected shift distance, found {:?}", t.tok),
                ))
            }
        };
        if (0..=7).contains(&v) {
            Ok(v as u8)
        } else {
            Err(Error::new(
                ErrorKind::NumberOutOfRange,
                line,
                col,
                format!("shift distance {v} is outside 0..7"),
            ))
        }
    }
}
